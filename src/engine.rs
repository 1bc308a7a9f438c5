//! The storage and lifecycle engine behind every entry point.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::modules::aggregate::{AggregateBucket, ContinuousAggregate, RefreshReport};
use crate::modules::alerts::AlertService;
use crate::modules::commands::CommandService;
use crate::modules::credentials::{CredentialService, SharedEncryptor};
use crate::modules::hypertable::{ChunkInfo, ChunkPolicy, Hypertable};
use crate::modules::ingest::{IngestReceipt, IngestWindow, IngestionPath};
use crate::modules::lifecycle::{compression, retention, PassBudget, PassOutcome, SingleFlight};
use crate::modules::registry::Registry;
use crate::shared::config::Configs;
use crate::shared::context::CallerContext;
use crate::shared::db::models::{
    Alert, AlertId, Command, NewCommand, NewReading, Reading, SensorId, UserId,
};
use crate::shared::db::schema::ReadingKey;
use crate::shared::db::{Capabilities, Persistence, Store};
use crate::shared::errors::{AppError, AppResult};

/// What an organization delete removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrganizationPurge {
    pub assets: usize,
    pub sensors: usize,
    pub readings: usize,
    pub rollups: usize,
    pub alerts: usize,
    pub commands: usize,
    pub credentials: usize,
}

#[derive(Debug)]
pub struct TelemetryEngine {
    configs: Configs,
    capabilities: Capabilities,
    registry: Registry,
    hypertable: Hypertable,
    ingest: IngestionPath,
    aggregates: ContinuousAggregate,
    alerts: AlertService,
    commands: CommandService,
    credentials: Option<CredentialService>,
    store: Persistence,
    // Writers hold it shared; an organization delete holds it exclusively.
    tenant_gate: RwLock<()>,
    retention_flight: SingleFlight,
    compression_flight: SingleFlight,
    refresh_flight: SingleFlight,
}

fn as_policy_failure(policy: &'static str, err: AppError) -> AppError {
    match err {
        AppError::PolicyFailure { .. } => err,
        other => AppError::PolicyFailure {
            policy,
            message: other.to_string(),
        },
    }
}

impl TelemetryEngine {
    /// Detects storage capabilities, opens the store and restores every
    /// service from it.
    pub async fn open(configs: Configs) -> AppResult<Self> {
        configs.validate()?;
        let capabilities = Capabilities::detect(&configs.storage, &configs.lifecycle);
        let policy = if capabilities.chunking {
            ChunkPolicy::new(configs.storage.chunk_interval(), configs.storage.partitions)
        } else {
            ChunkPolicy::unbounded(configs.storage.partitions)
        };

        let store = match &configs.storage.database_url {
            Some(url) => Persistence::new(Store::open(url, configs.storage.pool_size).await?),
            None => {
                log::warn!("storage.database_url not set, nothing will survive a restart");
                Persistence::default()
            }
        };
        let window = IngestWindow {
            retention_horizon: configs.lifecycle.retention_horizon(),
            max_future_skew: configs.storage.max_future_skew(),
        };

        let engine = TelemetryEngine {
            capabilities,
            registry: Registry::with_store(store.clone()),
            hypertable: Hypertable::with_store(policy, store.clone()),
            ingest: IngestionPath::new(window),
            aggregates: ContinuousAggregate::with_store(store.clone()),
            alerts: AlertService::with_store(store.clone()),
            commands: CommandService::with_store(store.clone()),
            credentials: None,
            store,
            tenant_gate: RwLock::new(()),
            retention_flight: SingleFlight::default(),
            compression_flight: SingleFlight::default(),
            refresh_flight: SingleFlight::default(),
            configs,
        };
        engine.restore(Utc::now()).await?;
        Ok(engine)
    }

    async fn restore(&self, now: DateTime<Utc>) -> AppResult<()> {
        if !self.store.is_durable() {
            return Ok(());
        }
        self.registry.restore().await?;

        let cutoff = if self.capabilities.retention {
            Some(retention::cutoff(now, self.configs.lifecycle.retention_horizon()))
        } else {
            None
        };
        let rows = self.hypertable.restore(cutoff).await?;
        self.ingest.observe_ids(&rows);

        self.aggregates.restore().await?;
        // Rows committed after the last refresh are not known to be rolled up.
        self.aggregates.invalidate(&rows).await;
        self.alerts.restore(&self.hypertable).await?;
        self.commands.restore().await?;
        Ok(())
    }

    /// Enables connection credentials and loads the stored ones.
    pub async fn with_encryptor(mut self, encryptor: SharedEncryptor) -> AppResult<Self> {
        let credentials = CredentialService::with_store(encryptor, self.store.clone());
        credentials.restore().await?;
        self.credentials = Some(credentials);
        Ok(self)
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn alerts(&self) -> &AlertService {
        &self.alerts
    }

    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    pub fn credentials(&self) -> AppResult<&CredentialService> {
        self.credentials
            .as_ref()
            .ok_or_else(|| AppError::Configuration("no encryption capability configured".into()))
    }

    pub async fn chunk_infos(&self) -> Vec<ChunkInfo> {
        self.hypertable.chunk_infos().await
    }

    pub async fn ingest_readings(&self, ctx: &CallerContext, batch: Vec<NewReading>) -> AppResult<IngestReceipt> {
        self.ingest_readings_at(ctx, batch, Utc::now()).await
    }

    /// Commits the batch, then queues the derived work: threshold
    /// evaluation, rollup invalidation and asset liveness.
    pub async fn ingest_readings_at(
        &self,
        ctx: &CallerContext,
        batch: Vec<NewReading>,
        now: DateTime<Utc>,
    ) -> AppResult<IngestReceipt> {
        let _gate = self.tenant_gate.read().await;
        let prepared = self.ingest.prepare(ctx, batch, &self.registry, now).await?;
        let receipt = self.ingest.commit(&self.hypertable, &prepared).await?;

        self.aggregates.invalidate(&prepared.rows).await;
        if let Err(e) = self
            .registry
            .touch_assets(&prepared.organization_id, &prepared.assets_seen)
            .await
        {
            log::warn!("asset liveness not recorded: {}", e);
        }
        self.alerts.outbox().push(prepared.rows).await;
        Ok(receipt)
    }

    /// Readings of one sensor in `[from, to)`, ordered by timestamp.
    pub async fn query_readings(
        &self,
        ctx: &CallerContext,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        self.registry.get_sensor(ctx, sensor_id).await?;
        self.hypertable
            .query_sensor(&ctx.organization_id, sensor_id, from, to)
            .await
    }

    pub async fn query_organization_readings(
        &self,
        ctx: &CallerContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        self.hypertable
            .query_organization(&ctx.organization_id, from, to)
            .await
    }

    pub async fn get_reading(&self, ctx: &CallerContext, key: &ReadingKey) -> AppResult<Reading> {
        self.hypertable
            .get(&ctx.organization_id, key)
            .await?
            .ok_or_else(|| AppError::not_found("reading", key.id))
    }

    pub async fn query_hourly_aggregate(
        &self,
        ctx: &CallerContext,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<AggregateBucket>> {
        self.registry.get_sensor(ctx, sensor_id).await?;
        Ok(self
            .aggregates
            .query(&ctx.organization_id, sensor_id, from, to)
            .await)
    }

    pub async fn list_alerts(
        &self,
        ctx: &CallerContext,
        organization_id: &str,
        acknowledged: Option<bool>,
    ) -> AppResult<Vec<Alert>> {
        self.alerts.list(ctx, organization_id, acknowledged).await
    }

    pub async fn acknowledge_alert(&self, ctx: &CallerContext, id: AlertId, actor: &UserId) -> AppResult<Alert> {
        self.alerts.acknowledge(ctx, id, actor, None).await
    }

    /// Drains the evaluation outbox. Returns the number of alerts raised.
    pub async fn evaluate_alerts(&self) -> usize {
        self.alerts.evaluate_pending(&self.registry).await
    }

    pub async fn create_command(&self, ctx: &CallerContext, new: NewCommand) -> AppResult<Command> {
        let _gate = self.tenant_gate.read().await;
        let sensor = self
            .registry
            .get_sensor(ctx, new.sensor_id)
            .await
            .map_err(|_| AppError::InvalidReference {
                entity: "sensor",
                key: new.sensor_id.to_string(),
            })?;
        self.commands.create(ctx, &sensor, new).await
    }

    pub async fn run_retention_pass(&self) -> AppResult<PassOutcome> {
        self.run_retention_pass_at(Utc::now(), &CancellationToken::new())
            .await
    }

    pub async fn run_retention_pass_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> AppResult<PassOutcome> {
        if !self.capabilities.retention {
            return Ok(PassOutcome::Unsupported);
        }
        let _flight = match self.retention_flight.try_enter() {
            Some(guard) => guard,
            None => return Ok(PassOutcome::Coalesced),
        };

        let lifecycle = &self.configs.lifecycle;
        let budget = PassBudget::new("retention", lifecycle.pass_timeout(), cancel);
        let report = retention::run_pass(&self.hypertable, now, lifecycle.retention_horizon(), &budget)
            .await
            .map_err(|e| as_policy_failure("retention", e))?;
        if report.processed > 0 {
            log::info!(
                "retention pass dropped {} chunk(s), {} readings",
                report.processed,
                report.rows
            );
        }
        Ok(PassOutcome::Completed(report))
    }

    pub async fn run_compression_pass(&self) -> AppResult<PassOutcome> {
        self.run_compression_pass_at(Utc::now(), &CancellationToken::new())
            .await
    }

    pub async fn run_compression_pass_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> AppResult<PassOutcome> {
        if !self.capabilities.compression {
            return Ok(PassOutcome::Unsupported);
        }
        let _flight = match self.compression_flight.try_enter() {
            Some(guard) => guard,
            None => return Ok(PassOutcome::Coalesced),
        };

        let lifecycle = &self.configs.lifecycle;
        let budget = PassBudget::new("compression", lifecycle.pass_timeout(), cancel);
        let report = compression::run_pass(
            &self.hypertable,
            now,
            lifecycle.compression_after(),
            lifecycle.retention_horizon(),
            &budget,
        )
        .await
        .map_err(|e| as_policy_failure("compression", e))?;
        if report.processed > 0 {
            log::info!(
                "compression pass packed {} chunk(s): {} -> {} bytes",
                report.processed,
                report.bytes_before,
                report.bytes_after
            );
        }
        Ok(PassOutcome::Completed(report))
    }

    pub async fn refresh_aggregates(&self) -> AppResult<PassOutcome<RefreshReport>> {
        self.refresh_aggregates_at(Utc::now()).await
    }

    pub async fn refresh_aggregates_at(&self, now: DateTime<Utc>) -> AppResult<PassOutcome<RefreshReport>> {
        let _flight = match self.refresh_flight.try_enter() {
            Some(guard) => guard,
            None => return Ok(PassOutcome::Coalesced),
        };
        // Without retention raw rows never expire, so every bucket stays refreshable.
        let cutoff = if self.capabilities.retention {
            retention::cutoff(now, self.configs.lifecycle.retention_horizon())
        } else {
            DateTime::<Utc>::MIN_UTC
        };
        let report = self
            .aggregates
            .refresh(&self.hypertable, cutoff)
            .await
            .map_err(|e| as_policy_failure("aggregate refresh", e))?;
        Ok(PassOutcome::Completed(report))
    }

    /// Removes the organization and everything it owns, readings included.
    ///
    /// Writers are shut out and a running aggregate refresh is waited for
    /// before anything is purged. Raw readings go before their rollups, and
    /// the stored registry rows go last.
    pub async fn delete_organization(&self, ctx: &CallerContext, organization_id: &str) -> AppResult<OrganizationPurge> {
        let org = self.registry.get_organization(ctx, organization_id).await?;
        let _refresh = self.refresh_flight.wait().await;
        let _gate = self.tenant_gate.write().await;

        let registry = self.registry.remove_organization(&org.id).await?;
        let mut purge = OrganizationPurge {
            assets: registry.assets,
            sensors: registry.sensors,
            ..OrganizationPurge::default()
        };
        purge.readings = self.hypertable.purge_organization(&org.id).await?;
        purge.rollups = self.aggregates.purge_organization(&org.id).await?;
        purge.alerts = self.alerts.purge_organization(&org.id).await?;
        purge.commands = self.commands.purge_organization(&org.id).await?;
        if let Some(credentials) = &self.credentials {
            purge.credentials = credentials.purge_organization(&org.id).await?;
        }
        self.registry.erase_organization(&org.id).await?;

        log::info!("organization {} deleted by {}: {:?}", org.id, ctx.user_id, purge);
        Ok(purge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::shared::context::Role;
    use crate::shared::db::models::{NewAsset, NewSensor, Protocol, SensorType, SubscriptionPlan};
    use crate::shared::errors::ErrorType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 19, 12, 0, 0).unwrap()
    }

    fn durable(dir: &tempfile::TempDir) -> Configs {
        let mut configs = Configs::default();
        configs.storage.database_url = Some(dir.path().join("telemetry.db").to_string_lossy().into_owned());
        configs
    }

    async fn tenant(engine: &TelemetryEngine) -> (CallerContext, SensorId) {
        let org = engine
            .registry()
            .create_organization("acme", "u1", SubscriptionPlan::Pro, 5)
            .await
            .unwrap();
        let ctx = CallerContext::new("u1", org.id, Role::Owner);
        let asset = engine
            .registry()
            .create_asset(
                &ctx,
                NewAsset {
                    name: "boiler".to_string(),
                    type_: "boiler".to_string(),
                    location: "plant 1".to_string(),
                    organization_id: None,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        let sensor = engine
            .registry()
            .create_sensor(
                &ctx,
                NewSensor {
                    asset_id: asset.id,
                    name: "outlet".to_string(),
                    type_: SensorType::Temperature,
                    unit: "C".to_string(),
                    threshold_low: None,
                    threshold_high: Some(90.0),
                    min_value: None,
                    max_value: None,
                    sampling_interval_ms: 1000,
                    protocol: Protocol::Mqtt,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        (ctx, sensor.id)
    }

    #[tokio::test]
    async fn a_pass_already_running_coalesces_the_next() {
        let engine = TelemetryEngine::open(Configs::default()).await.unwrap();
        let cancel = CancellationToken::new();

        {
            let _running = engine.retention_flight.try_enter().unwrap();
            let outcome = engine.run_retention_pass_at(now(), &cancel).await.unwrap();
            assert!(matches!(outcome, PassOutcome::Coalesced));
        }
        {
            let _running = engine.compression_flight.try_enter().unwrap();
            let outcome = engine.run_compression_pass_at(now(), &cancel).await.unwrap();
            assert!(matches!(outcome, PassOutcome::Coalesced));
        }
        {
            let _running = engine.refresh_flight.try_enter().unwrap();
            let outcome = engine.refresh_aggregates_at(now()).await.unwrap();
            assert!(matches!(outcome, PassOutcome::Coalesced));
        }

        let outcome = engine.run_retention_pass_at(now(), &cancel).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(_)));
        let outcome = engine.refresh_aggregates_at(now()).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn chunk_dropped_before_commit_rejects_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let ts = now - Duration::hours(2);
        let (ctx, sensor) = {
            let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
            let (ctx, sensor) = tenant(&engine).await;
            engine
                .ingest_readings_at(&ctx, vec![NewReading::new(sensor, 20.0).at(ts)], now)
                .await
                .unwrap();

            let prepared = engine
                .ingest
                .prepare(&ctx, vec![NewReading::new(sensor, 21.0).at(ts)], &engine.registry, now)
                .await
                .unwrap();
            let chunk = engine.hypertable.policy().assign(ts, &ctx.organization_id);
            assert_eq!(engine.hypertable.drop_chunk(&chunk).await.unwrap(), Some(1));

            let err = engine.ingest.commit(&engine.hypertable, &prepared).await.unwrap_err();
            assert_eq!(err.kind(), ErrorType::OutOfRange);
            (ctx, sensor)
        };

        let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
        let rows = engine
            .query_readings(&ctx, sensor, ts - Duration::hours(1), now)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(engine.evaluate_alerts().await, 0);
    }

    #[tokio::test]
    async fn deleted_organization_leaves_nothing_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let ctx = {
            let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
            let (ctx, sensor) = tenant(&engine).await;
            let batch = vec![
                NewReading::new(sensor, 95.0).at(now - Duration::hours(3)),
                NewReading::new(sensor, 20.0).at(now - Duration::hours(2)),
            ];
            engine.ingest_readings_at(&ctx, batch, now).await.unwrap();
            engine.refresh_aggregates_at(now).await.unwrap();

            let purge = engine.delete_organization(&ctx, &ctx.organization_id).await.unwrap();
            assert_eq!((purge.readings, purge.rollups, purge.sensors), (2, 2, 1));
            assert_eq!(engine.evaluate_alerts().await, 0);
            ctx
        };

        let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
        assert!(!engine.registry().organization_exists(&ctx.organization_id).await);
        assert!(engine.chunk_infos().await.iter().all(|c| c.row_count == 0));
        assert_eq!(engine.evaluate_alerts().await, 0);
    }
}
