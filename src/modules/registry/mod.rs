//! Organizations, assets and sensors.
//!
//! Plain keyed tables. Everything below `Organization` is reached through a
//! `CallerContext`, so a foreign id behaves exactly like a missing one.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::shared::context::CallerContext;
use crate::shared::db::models::{
    Asset, AssetId, AssetStatus, NewAsset, NewSensor, Organization, OrganizationId,
    Sensor, SensorId, SubscriptionPlan, UserId,
};
use crate::shared::db::records::{AssetRow, OrganizationRow, SensorRow};
use crate::shared::db::{IdSequence, Persistence};
use crate::shared::errors::{AppError, AppResult};

/// Each asset has its own lock so liveness updates from concurrent batches
/// only contend on the assets they share.
type AssetHandle = Arc<Mutex<Asset>>;

#[derive(Debug, Default)]
pub struct Registry {
    organizations: RwLock<HashMap<OrganizationId, Organization>>,
    assets: RwLock<BTreeMap<AssetId, AssetHandle>>,
    sensors: RwLock<BTreeMap<SensorId, Sensor>>,
    asset_ids: IdSequence,
    sensor_ids: IdSequence,
    store: Persistence,
}

/// Counts of what an organization delete removed from the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryPurge {
    pub assets: usize,
    pub sensors: usize,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn with_store(store: Persistence) -> Self {
        Registry {
            store,
            ..Registry::default()
        }
    }

    /// Loads organizations, assets and sensors from the store.
    pub async fn restore(&self) -> AppResult<()> {
        let orgs = self.store.load(|db| db.load_organizations()).await?;
        let assets = self.store.load(|db| db.load_assets()).await?;
        let sensors = self.store.load(|db| db.load_sensors()).await?;
        let counts = (orgs.len(), assets.len(), sensors.len());

        {
            let mut map = self.organizations.write().await;
            for row in orgs {
                let org = row.into_model()?;
                map.insert(org.id.clone(), org);
            }
        }
        {
            let mut map = self.assets.write().await;
            for row in assets {
                let asset = row.into_model()?;
                self.asset_ids.observe(asset.id);
                map.insert(asset.id, Arc::new(Mutex::new(asset)));
            }
        }
        {
            let mut map = self.sensors.write().await;
            for row in sensors {
                let sensor = row.into_model()?;
                self.sensor_ids.observe(sensor.id);
                map.insert(sensor.id, sensor);
            }
        }
        log::info!(
            "registry restored: {} organizations, {} assets, {} sensors",
            counts.0,
            counts.1,
            counts.2
        );
        Ok(())
    }

    pub async fn create_organization(
        &self,
        name: &str,
        owner_id: impl Into<UserId>,
        subscription_plan: SubscriptionPlan,
        storage_limit_gb: u32,
    ) -> AppResult<Organization> {
        let org = Organization {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: owner_id.into(),
            subscription_plan,
            storage_limit_gb,
            created_at: Utc::now(),
        };
        let row = OrganizationRow::from_model(&org)?;
        self.store.write(move |db| db.insert_organization(&row)).await?;
        log::info!("organization {} ('{}') created", org.id, org.name);
        self.organizations
            .write()
            .await
            .insert(org.id.clone(), org.clone());
        Ok(org)
    }

    pub async fn organization_exists(&self, organization_id: &str) -> bool {
        self.organizations.read().await.contains_key(organization_id)
    }

    pub async fn get_organization(&self, ctx: &CallerContext, id: &str) -> AppResult<Organization> {
        let found = self.organizations.read().await.get(id).cloned();
        ctx.scope(found, |o| o.id.as_str(), "organization", id)
    }

    /// Takes the organization and everything the registry holds for it out
    /// of service. From here on no sensor of it resolves, so no new rows can
    /// be written for it. The stored rows go with `erase_organization`.
    pub async fn remove_organization(&self, organization_id: &str) -> AppResult<RegistryPurge> {
        if self
            .organizations
            .write()
            .await
            .remove(organization_id)
            .is_none()
        {
            return Err(AppError::not_found("organization", organization_id));
        }

        let mut purge = RegistryPurge::default();
        {
            let mut sensors = self.sensors.write().await;
            let before = sensors.len();
            sensors.retain(|_, s| s.organization_id != organization_id);
            purge.sensors = before - sensors.len();
        }
        {
            let mut assets = self.assets.write().await;
            let mut owned = Vec::new();
            for (id, handle) in assets.iter() {
                if handle.lock().await.organization_id == organization_id {
                    owned.push(*id);
                }
            }
            for id in &owned {
                assets.remove(id);
            }
            purge.assets = owned.len();
        }
        Ok(purge)
    }

    /// Deletes the stored registry rows of an organization already removed.
    pub async fn erase_organization(&self, organization_id: &str) -> AppResult<()> {
        let org = organization_id.to_string();
        self.store.write(move |db| db.delete_registry(&org)).await
    }

    pub async fn create_asset(&self, ctx: &CallerContext, new: NewAsset) -> AppResult<Asset> {
        ctx.check_payload(new.organization_id.as_deref())?;
        if !self.organization_exists(&ctx.organization_id).await {
            return Err(AppError::InvalidReference {
                entity: "organization",
                key: ctx.organization_id.clone(),
            });
        }

        let asset = Asset {
            id: self.asset_ids.next(),
            organization_id: ctx.organization_id.clone(),
            name: new.name,
            type_: new.type_,
            location: new.location,
            status: AssetStatus::Offline,
            last_seen: None,
            metadata: new.metadata,
        };
        let row = AssetRow::from_model(&asset)?;
        self.store.write(move |db| db.upsert_asset(&row)).await?;
        self.assets
            .write()
            .await
            .insert(asset.id, Arc::new(Mutex::new(asset.clone())));
        Ok(asset)
    }

    pub async fn get_asset(&self, ctx: &CallerContext, id: AssetId) -> AppResult<Asset> {
        let handle = self.assets.read().await.get(&id).cloned();
        let found = match handle {
            Some(h) => Some(h.lock().await.clone()),
            None => None,
        };
        ctx.scope(found, |a| a.organization_id.as_str(), "asset", id)
    }

    pub async fn list_assets(&self, ctx: &CallerContext) -> Vec<Asset> {
        let handles: Vec<AssetHandle> = self.assets.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for h in handles {
            let asset = h.lock().await;
            if ctx.owns(&asset.organization_id) {
                out.push(asset.clone());
            }
        }
        out
    }

    /// Marks assets online after their sensors reported. `last_seen` only moves forward.
    pub async fn touch_assets(
        &self,
        organization_id: &str,
        seen: &HashMap<AssetId, DateTime<Utc>>,
    ) -> AppResult<()> {
        let handles: Vec<(AssetHandle, DateTime<Utc>)> = {
            let assets = self.assets.read().await;
            seen.iter()
                .filter_map(|(id, at)| assets.get(id).map(|h| (h.clone(), *at)))
                .collect()
        };

        for (handle, at) in handles {
            let mut asset = handle.lock().await;
            if asset.organization_id != organization_id {
                continue;
            }
            let mut next = asset.clone();
            next.status = AssetStatus::Online;
            if next.last_seen.map_or(true, |prev| prev < at) {
                next.last_seen = Some(at);
            }
            if next == *asset {
                continue;
            }
            let row = AssetRow::from_model(&next)?;
            self.store.write(move |db| db.upsert_asset(&row)).await?;
            *asset = next;
        }
        Ok(())
    }

    /// The sensor inherits the organization of its asset.
    pub async fn create_sensor(&self, ctx: &CallerContext, new: NewSensor) -> AppResult<Sensor> {
        let asset = self
            .get_asset(ctx, new.asset_id)
            .await
            .map_err(|_| AppError::InvalidReference {
                entity: "asset",
                key: new.asset_id.to_string(),
            })?;

        if let (Some(low), Some(high)) = (new.threshold_low, new.threshold_high) {
            if low > high {
                return Err(AppError::Configuration(format!(
                    "threshold_low {} is above threshold_high {}",
                    low, high
                )));
            }
        }

        let sensor = Sensor {
            id: self.sensor_ids.next(),
            organization_id: asset.organization_id,
            asset_id: asset.id,
            name: new.name,
            type_: new.type_,
            unit: new.unit,
            threshold_low: new.threshold_low,
            threshold_high: new.threshold_high,
            min_value: new.min_value,
            max_value: new.max_value,
            sampling_interval_ms: new.sampling_interval_ms,
            is_active: true,
            protocol: new.protocol,
            metadata: new.metadata,
        };
        log::debug!(
            "sensor {} '{}' created on asset {} for {}",
            sensor.id,
            sensor.name,
            sensor.asset_id,
            sensor.organization_id
        );
        let row = SensorRow::from_model(&sensor)?;
        self.store.write(move |db| db.upsert_sensor(&row)).await?;
        self.sensors.write().await.insert(sensor.id, sensor.clone());
        Ok(sensor)
    }

    pub async fn get_sensor(&self, ctx: &CallerContext, id: SensorId) -> AppResult<Sensor> {
        let found = self.sensors.read().await.get(&id).cloned();
        ctx.scope(found, |s| s.organization_id.as_str(), "sensor", id)
    }

    /// Lookup for internal paths that already know the organization.
    pub async fn sensor_in(&self, organization_id: &str, id: SensorId) -> Option<Sensor> {
        self.sensors
            .read()
            .await
            .get(&id)
            .filter(|s| s.organization_id == organization_id)
            .cloned()
    }

    /// Resolves many sensors of one organization under a single lock.
    pub async fn sensors_in(
        &self,
        organization_id: &str,
        ids: impl IntoIterator<Item = SensorId>,
    ) -> HashMap<SensorId, Sensor> {
        let sensors = self.sensors.read().await;
        ids.into_iter()
            .filter_map(|id| {
                sensors
                    .get(&id)
                    .filter(|s| s.organization_id == organization_id)
                    .map(|s| (id, s.clone()))
            })
            .collect()
    }

    pub async fn list_sensors(&self, ctx: &CallerContext, asset_id: AssetId) -> AppResult<Vec<Sensor>> {
        self.get_asset(ctx, asset_id).await?;
        Ok(self
            .sensors
            .read()
            .await
            .values()
            .filter(|s| s.asset_id == asset_id && ctx.owns(&s.organization_id))
            .cloned()
            .collect())
    }

    pub async fn update_thresholds(
        &self,
        ctx: &CallerContext,
        id: SensorId,
        threshold_low: Option<f64>,
        threshold_high: Option<f64>,
    ) -> AppResult<Sensor> {
        if let (Some(low), Some(high)) = (threshold_low, threshold_high) {
            if low > high {
                return Err(AppError::Configuration(format!(
                    "threshold_low {} is above threshold_high {}",
                    low, high
                )));
            }
        }
        let mut sensors = self.sensors.write().await;
        match sensors.get_mut(&id) {
            Some(s) if ctx.owns(&s.organization_id) => {
                let mut next = s.clone();
                next.threshold_low = threshold_low;
                next.threshold_high = threshold_high;
                let row = SensorRow::from_model(&next)?;
                self.store.write(move |db| db.upsert_sensor(&row)).await?;
                *s = next;
                Ok(s.clone())
            }
            _ => Err(AppError::not_found("sensor", id)),
        }
    }
}
