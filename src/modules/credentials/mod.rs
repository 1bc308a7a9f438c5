//! Credentials for external endpoints (brokers, OPC UA servers, ...).
//!
//! Passwords are handed to the `Encryptor` on the way in and only come back
//! out through `decrypt_password`. Nothing here logs a secret.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::shared::context::CallerContext;
use crate::shared::db::models::{ConnectionCredential, CredentialId, CredentialUpdate, NewCredential};
use crate::shared::db::records::CredentialRow;
use crate::shared::db::{IdSequence, Persistence};
use crate::shared::errors::{AppError, AppResult};

/// The external encryption capability.
pub trait Encryptor {
    /// Returns `(ciphertext, iv)`.
    fn encrypt(&self, plaintext: &str) -> AppResult<(String, String)>;
    fn decrypt(&self, ciphertext: &str, iv: &str) -> AppResult<String>;
}

pub type SharedEncryptor = Arc<dyn Encryptor + Send + Sync>;

pub struct CredentialService {
    encryptor: SharedEncryptor,
    rows: RwLock<BTreeMap<CredentialId, ConnectionCredential>>,
    ids: IdSequence,
    store: Persistence,
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService").finish_non_exhaustive()
    }
}

impl CredentialService {
    pub fn new(encryptor: SharedEncryptor) -> Self {
        CredentialService::with_store(encryptor, Persistence::default())
    }

    pub fn with_store(encryptor: SharedEncryptor, store: Persistence) -> Self {
        CredentialService {
            encryptor,
            rows: RwLock::new(BTreeMap::new()),
            ids: IdSequence::new(),
            store,
        }
    }

    pub async fn restore(&self) -> AppResult<()> {
        let stored = self.store.load(|db| db.load_credentials()).await?;
        let mut rows = self.rows.write().await;
        for row in stored {
            let credential = row.into_model()?;
            self.ids.observe(credential.id);
            rows.insert(credential.id, credential);
        }
        log::info!("restored {} credential(s)", rows.len());
        Ok(())
    }

    pub async fn create(&self, ctx: &CallerContext, new: NewCredential) -> AppResult<ConnectionCredential> {
        let mut rows = self.rows.write().await;
        if rows
            .values()
            .any(|c| c.organization_id == ctx.organization_id && c.name == new.name)
        {
            return Err(AppError::DuplicateConstraint {
                field: "connection name",
                value: new.name,
            });
        }

        let (encrypted_password, encryption_iv) = self.encryptor.encrypt(&new.password)?;
        let credential = ConnectionCredential {
            id: self.ids.next(),
            organization_id: ctx.organization_id.clone(),
            name: new.name,
            endpoint_uri: new.endpoint_uri,
            client_id: new.client_id,
            username: new.username,
            encrypted_password,
            encryption_iv,
            protocol: new.protocol,
            created_at: Utc::now(),
            last_used_at: None,
            is_active: true,
        };
        log::info!(
            "credential {} '{}' created for {} by {}",
            credential.id,
            credential.name,
            credential.organization_id,
            ctx.user_id
        );
        let row = CredentialRow::from_model(&credential);
        self.store.write(move |db| db.upsert_credential(&row)).await?;
        rows.insert(credential.id, credential.clone());
        Ok(credential)
    }

    pub async fn get(&self, ctx: &CallerContext, id: CredentialId) -> AppResult<ConnectionCredential> {
        let found = self.rows.read().await.get(&id).cloned();
        ctx.scope(found, |c| c.organization_id.as_str(), "credential", id)
    }

    pub async fn list(&self, ctx: &CallerContext) -> Vec<ConnectionCredential> {
        self.rows
            .read()
            .await
            .values()
            .filter(|c| ctx.owns(&c.organization_id))
            .cloned()
            .collect()
    }

    pub async fn update(
        &self,
        ctx: &CallerContext,
        id: CredentialId,
        update: CredentialUpdate,
    ) -> AppResult<ConnectionCredential> {
        let encrypted = match &update.password {
            Some(password) => Some(self.encryptor.encrypt(password)?),
            None => None,
        };
        self.modify(ctx, id, |c| {
            if let Some(uri) = update.endpoint_uri {
                c.endpoint_uri = uri;
            }
            if let Some(client_id) = update.client_id {
                c.client_id = Some(client_id);
            }
            if let Some(username) = update.username {
                c.username = username;
            }
            if let Some((ciphertext, iv)) = encrypted {
                c.encrypted_password = ciphertext;
                c.encryption_iv = iv;
            }
        })
        .await
    }

    /// Marks the credential as used.
    pub async fn decrypt_password(&self, ctx: &CallerContext, id: CredentialId) -> AppResult<String> {
        let credential = self.modify(ctx, id, |c| c.last_used_at = Some(Utc::now())).await?;
        self.encryptor
            .decrypt(&credential.encrypted_password, &credential.encryption_iv)
    }

    pub async fn set_active(&self, ctx: &CallerContext, id: CredentialId, active: bool) -> AppResult<ConnectionCredential> {
        self.modify(ctx, id, |c| c.is_active = active).await
    }

    pub async fn delete(&self, ctx: &CallerContext, id: CredentialId) -> AppResult<()> {
        let mut rows = self.rows.write().await;
        match rows.get(&id) {
            Some(c) if ctx.owns(&c.organization_id) => {
                self.store.write(move |db| db.delete_credential(id)).await?;
                rows.remove(&id);
                Ok(())
            }
            _ => Err(AppError::not_found("credential", id)),
        }
    }

    async fn modify(
        &self,
        ctx: &CallerContext,
        id: CredentialId,
        f: impl FnOnce(&mut ConnectionCredential),
    ) -> AppResult<ConnectionCredential> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(c) if ctx.owns(&c.organization_id) => {
                let mut updated = c.clone();
                f(&mut updated);
                let row = CredentialRow::from_model(&updated);
                self.store.write(move |db| db.upsert_credential(&row)).await?;
                *c = updated.clone();
                Ok(updated)
            }
            _ => Err(AppError::not_found("credential", id)),
        }
    }

    pub async fn purge_organization(&self, organization_id: &str) -> AppResult<usize> {
        let org = organization_id.to_string();
        self.store
            .write(move |db| db.delete_credentials(&org).map(|_| ()))
            .await?;
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, c| c.organization_id != organization_id);
        Ok(before - rows.len())
    }
}
