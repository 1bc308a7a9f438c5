//! Commands sent to sensors and their execution state machine.
//!
//! ```text
//! Pending -> Executing -> Completed
//!                      -> Failed -> Pending   (while retry_count < max_retries)
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::shared::context::CallerContext;
use crate::shared::db::models::{
    Command, CommandId, CommandStatus, NewCommand, OrganizationId, Sensor, SensorId, UserId,
};
use crate::shared::db::records::CommandRow;
use crate::shared::db::schema::{CommandStatusIndexKey, CommandUserIndexKey};
use crate::shared::db::{IdSequence, Persistence};
use crate::shared::errors::{AppError, AppResult};

#[derive(Debug, Default)]
struct CommandTable {
    rows: HashMap<CommandId, Command>,
    by_status: BTreeSet<CommandStatusIndexKey>,
    by_user: BTreeSet<CommandUserIndexKey>,
}

impl CommandTable {
    fn insert(&mut self, command: Command) {
        self.by_status.insert(status_key(&command));
        self.by_user
            .insert((command.organization_id.clone(), command.user_id.clone(), command.id));
        self.rows.insert(command.id, command);
    }
}

fn status_key(c: &Command) -> CommandStatusIndexKey {
    (c.organization_id.clone(), c.status, c.created_at, c.id)
}

/// What a transition does to the row besides changing its status.
enum Transition {
    Execute,
    Complete(Option<String>),
    Fail(String),
    Retry,
}

impl Transition {
    fn target(&self) -> CommandStatus {
        match self {
            Transition::Execute => CommandStatus::Executing,
            Transition::Complete(_) => CommandStatus::Completed,
            Transition::Fail(_) => CommandStatus::Failed,
            Transition::Retry => CommandStatus::Pending,
        }
    }

    fn allowed_from(&self, from: CommandStatus) -> bool {
        matches!(
            (from, self.target()),
            (CommandStatus::Pending, CommandStatus::Executing)
                | (CommandStatus::Executing, CommandStatus::Completed)
                | (CommandStatus::Executing, CommandStatus::Failed)
                | (CommandStatus::Failed, CommandStatus::Pending)
        )
    }
}

#[derive(Debug, Default)]
pub struct CommandService {
    table: RwLock<CommandTable>,
    ids: IdSequence,
    store: Persistence,
}

impl CommandService {
    pub fn new() -> Self {
        CommandService::default()
    }

    pub fn with_store(store: Persistence) -> Self {
        CommandService {
            store,
            ..CommandService::default()
        }
    }

    pub async fn restore(&self) -> AppResult<()> {
        let stored = self.store.load(|db| db.load_commands()).await?;
        let mut table = self.table.write().await;
        for row in stored {
            let command = row.into_model()?;
            self.ids.observe(command.id);
            table.insert(command);
        }
        log::info!("restored {} command(s)", table.rows.len());
        Ok(())
    }

    /// `sensor` must already be resolved through the caller's organization.
    pub async fn create(&self, ctx: &CallerContext, sensor: &Sensor, new: NewCommand) -> AppResult<Command> {
        if new.sensor_id != sensor.id || !ctx.owns(&sensor.organization_id) {
            return Err(AppError::InvalidReference {
                entity: "sensor",
                key: new.sensor_id.to_string(),
            });
        }
        let command = Command {
            id: self.ids.next(),
            organization_id: ctx.organization_id.clone(),
            user_id: ctx.user_id.clone(),
            sensor_id: sensor.id,
            command_type: new.command_type,
            payload: new.payload,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            error_message: None,
            response: None,
            retry_count: 0,
            max_retries: new.max_retries,
            metadata: new.metadata,
        };
        log::info!(
            "command {} '{}' queued for sensor {} by {}",
            command.id,
            command.command_type,
            command.sensor_id,
            command.user_id
        );

        let row = CommandRow::from_model(&command)?;
        self.store.write(move |db| db.upsert_command(&row)).await?;
        self.table.write().await.insert(command.clone());
        Ok(command)
    }

    pub async fn get(&self, ctx: &CallerContext, id: CommandId) -> AppResult<Command> {
        let found = self.table.read().await.rows.get(&id).cloned();
        ctx.scope(found, |c| c.organization_id.as_str(), "command", id)
    }

    pub async fn list_by_sensor(&self, ctx: &CallerContext, sensor_id: SensorId) -> Vec<Command> {
        let table = self.table.read().await;
        let mut out: Vec<Command> = table
            .rows
            .values()
            .filter(|c| c.sensor_id == sensor_id && ctx.owns(&c.organization_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        out
    }

    /// Oldest first.
    pub async fn list_by_status(&self, ctx: &CallerContext, status: CommandStatus) -> Vec<Command> {
        let table = self.table.read().await;
        Self::scan_status(&table, &ctx.organization_id, status)
    }

    pub async fn list_by_user(&self, ctx: &CallerContext, user_id: &UserId) -> Vec<Command> {
        let table = self.table.read().await;
        let org = ctx.organization_id.clone();
        let lower = (org.clone(), user_id.clone(), i64::MIN);
        let upper = (org, user_id.clone(), i64::MAX);
        table
            .by_user
            .range(lower..=upper)
            .filter_map(|(.., id)| table.rows.get(id))
            .cloned()
            .collect()
    }

    fn scan_status(table: &CommandTable, organization_id: &str, status: CommandStatus) -> Vec<Command> {
        let lower = (organization_id.to_string(), status, DateTime::<Utc>::MIN_UTC, i64::MIN);
        let upper = (organization_id.to_string(), status, DateTime::<Utc>::MAX_UTC, i64::MAX);
        table
            .by_status
            .range(lower..=upper)
            .filter_map(|(.., id)| table.rows.get(id))
            .cloned()
            .collect()
    }

    /// Work for the dispatcher across every organization: pending commands,
    /// plus failed ones that still have retries left.
    pub async fn dispatchable(&self) -> (Vec<Command>, Vec<Command>) {
        let table = self.table.read().await;
        let orgs: BTreeSet<OrganizationId> =
            table.by_status.iter().map(|(org, ..)| org.clone()).collect();
        let mut pending = Vec::new();
        let mut retryable = Vec::new();
        for org in orgs {
            pending.extend(Self::scan_status(&table, &org, CommandStatus::Pending));
            retryable.extend(
                Self::scan_status(&table, &org, CommandStatus::Failed)
                    .into_iter()
                    .filter(|c| c.retry_count < c.max_retries),
            );
        }
        (pending, retryable)
    }

    pub async fn execute(&self, ctx: &CallerContext, id: CommandId) -> AppResult<Command> {
        self.transition(ctx, id, Transition::Execute).await
    }

    pub async fn complete(&self, ctx: &CallerContext, id: CommandId, response: Option<String>) -> AppResult<Command> {
        self.transition(ctx, id, Transition::Complete(response)).await
    }

    pub async fn fail(&self, ctx: &CallerContext, id: CommandId, error: impl Into<String>) -> AppResult<Command> {
        self.transition(ctx, id, Transition::Fail(error.into())).await
    }

    /// Failed -> Pending, consuming one retry.
    pub async fn retry(&self, ctx: &CallerContext, id: CommandId) -> AppResult<Command> {
        self.transition(ctx, id, Transition::Retry).await
    }

    async fn transition(&self, ctx: &CallerContext, id: CommandId, transition: Transition) -> AppResult<Command> {
        let mut table = self.table.write().await;
        let command = match table.rows.get(&id) {
            Some(c) if ctx.owns(&c.organization_id) => c,
            _ => return Err(AppError::not_found("command", id)),
        };

        let from = command.status;
        let to = transition.target();
        let exhausted = matches!(transition, Transition::Retry) && command.retry_count >= command.max_retries;
        if !transition.allowed_from(from) || exhausted {
            log::warn!(
                "command {} refused {} -> {} (retries {}/{})",
                id,
                from,
                to,
                command.retry_count,
                command.max_retries
            );
            return Err(AppError::InvalidTransition {
                entity: "command",
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let old_key = status_key(command);
        let now = Utc::now();
        let mut updated = command.clone();
        match transition {
            Transition::Execute => updated.executed_at = Some(now),
            Transition::Complete(response) => {
                updated.completed_at = Some(now);
                updated.response = response;
                updated.error_message = None;
            }
            Transition::Fail(error) => {
                updated.completed_at = Some(now);
                updated.error_message = Some(error);
            }
            Transition::Retry => {
                updated.retry_count += 1;
                updated.executed_at = None;
                updated.completed_at = None;
            }
        }
        updated.status = to;

        let row = CommandRow::from_model(&updated)?;
        self.store.write(move |db| db.upsert_command(&row)).await?;
        table.rows.insert(id, updated.clone());
        table.by_status.remove(&old_key);
        table.by_status.insert(status_key(&updated));
        log::debug!("command {} {} -> {}", id, from, to);
        Ok(updated)
    }

    pub async fn purge_organization(&self, organization_id: &str) -> AppResult<usize> {
        let org = organization_id.to_string();
        self.store
            .write(move |db| db.delete_commands(&org).map(|_| ()))
            .await?;
        let mut table = self.table.write().await;
        let before = table.rows.len();
        table.rows.retain(|_, c| c.organization_id != organization_id);
        table.by_status.retain(|(org, ..)| org != organization_id);
        table.by_user.retain(|(org, ..)| org != organization_id);
        Ok(before - table.rows.len())
    }
}
