use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use iot_telemetry::{
    modules::{
        aggregate::{hour_bucket, AggregateBucket},
        hypertable::ChunkState,
        lifecycle::{PassOutcome, PassReport},
    },
    shared::{
        config::Configs,
        context::{CallerContext, Role},
        db::models::{
            AlertSeverity, NewAsset, NewCommand, NewReading, NewSensor, Protocol, Sensor, SensorId, SensorType,
            SubscriptionPlan,
        },
        errors::ErrorType,
    },
    TelemetryEngine,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 19, 12, 0, 0).unwrap()
}

async fn engine() -> TelemetryEngine {
    TelemetryEngine::open(Configs::default()).await.unwrap()
}

async fn tenant(engine: &TelemetryEngine, name: &str) -> (CallerContext, Sensor) {
    let org = engine
        .registry()
        .create_organization(name, format!("owner-{}", name), SubscriptionPlan::Pro, 10)
        .await
        .unwrap();
    let ctx = CallerContext::new(format!("owner-{}", name), org.id, Role::Owner);
    let asset = engine
        .registry()
        .create_asset(
            &ctx,
            NewAsset {
                name: format!("{} boiler", name),
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
                name: "outlet temperature".to_string(),
                type_: SensorType::Temperature,
                unit: "C".to_string(),
                threshold_low: Some(10.0),
                threshold_high: Some(90.0),
                min_value: Some(-40.0),
                max_value: Some(125.0),
                sampling_interval_ms: 1000,
                protocol: Protocol::Mqtt,
                metadata: Default::default(),
            },
        )
        .await
        .unwrap();
    (ctx, sensor)
}

fn completed<R: std::fmt::Debug>(outcome: PassOutcome<R>) -> R {
    match outcome {
        PassOutcome::Completed(report) => report,
        other => panic!("pass did not complete: {:?}", other),
    }
}

#[tokio::test]
async fn tenants_never_see_each_others_readings() {
    let engine = engine().await;
    let (a, sensor_a) = tenant(&engine, "acme").await;
    let (b, _) = tenant(&engine, "globex").await;

    let batch = (0..5)
        .map(|i| NewReading::new(sensor_a.id, 20.0 + i as f64).at(now() - Duration::minutes(i)))
        .collect();
    let receipt = engine.ingest_readings_at(&a, batch, now()).await.unwrap();
    assert_eq!(receipt.accepted, 5);

    let window = (now() - Duration::hours(1), now() + Duration::minutes(1));
    let own = engine.query_readings(&a, sensor_a.id, window.0, window.1).await.unwrap();
    assert_eq!(own.len(), 5);
    assert!(own.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let err = engine
        .query_readings(&b, sensor_a.id, window.0, window.1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::NotFound);
    let foreign = engine
        .query_organization_readings(&b, window.0, window.1)
        .await
        .unwrap();
    assert!(foreign.is_empty());

    // B cannot write into A's sensor, nor claim A's organization.
    let err = engine
        .ingest_readings_at(&b, vec![NewReading::new(sensor_a.id, 1.0)], now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::InvalidReference);
    let mut spoofed = NewReading::new(sensor_a.id, 1.0);
    spoofed.organization_id = Some(b.organization_id.clone());
    let err = engine.ingest_readings_at(&a, vec![spoofed], now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorType::TenantMismatch);
}

#[tokio::test]
async fn reading_above_threshold_raises_exactly_one_alert() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let (other, _) = tenant(&engine, "globex").await;

    let receipt = engine
        .ingest_readings_at(&ctx, vec![NewReading::new(sensor.id, 95.0).at(now())], now())
        .await
        .unwrap();
    assert_eq!(engine.evaluate_alerts().await, 1);
    assert_eq!(engine.evaluate_alerts().await, 0);

    let alerts = engine.list_alerts(&ctx, &ctx.organization_id, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert_eq!(alert.threshold_value, Some(90.0));
    assert_eq!(alert.trigger_value, 95.0);
    assert_eq!(
        alert.metadata.get("reading_id"),
        Some(&receipt.reading_ids[0].to_string())
    );

    let err = engine
        .list_alerts(&other, &ctx.organization_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::TenantMismatch);
    let err = engine
        .acknowledge_alert(&other, alert.id, &other.user_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::NotFound);

    let acked = engine.acknowledge_alert(&ctx, alert.id, &ctx.user_id).await.unwrap();
    let again = engine.acknowledge_alert(&ctx, alert.id, &ctx.user_id).await.unwrap();
    assert!(acked.acknowledged);
    assert_eq!(acked.acknowledged_at, again.acknowledged_at);
    assert!(engine
        .list_alerts(&ctx, &ctx.organization_id, Some(false))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn value_outside_physical_range_is_critical() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    engine
        .ingest_readings_at(
            &ctx,
            vec![
                NewReading::new(sensor.id, 130.0).at(now()),
                NewReading::new(sensor.id, 5.0).at(now() - Duration::seconds(1)),
                NewReading::new(sensor.id, 50.0).at(now() - Duration::seconds(2)),
            ],
            now(),
        )
        .await
        .unwrap();
    assert_eq!(engine.evaluate_alerts().await, 2);

    let alerts = engine.list_alerts(&ctx, &ctx.organization_id, Some(false)).await.unwrap();
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(alerts[1].severity, AlertSeverity::Warning);
    assert_eq!(alerts[1].threshold_value, Some(10.0));
}

#[tokio::test]
async fn retention_drops_only_fully_aged_chunks_and_is_idempotent() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let batch = vec![
        NewReading::new(sensor.id, 1.0).at(now() - Duration::days(29)),
        NewReading::new(sensor.id, 2.0).at(now() - Duration::days(28)),
        NewReading::new(sensor.id, 3.0).at(now() - Duration::hours(1)),
    ];
    engine.ingest_readings_at(&ctx, batch, now()).await.unwrap();

    // Two days later the oldest chunk is fully past the horizon and the
    // horizon falls inside the next one.
    let later = now() + Duration::days(2);
    let cancel = CancellationToken::new();
    let report: PassReport = completed(engine.run_retention_pass_at(later, &cancel).await.unwrap());
    assert_eq!((report.processed, report.rows), (1, 1));

    let again = completed(engine.run_retention_pass_at(later, &cancel).await.unwrap());
    assert_eq!((again.eligible, again.processed), (0, 0));

    let left = engine
        .query_readings(&ctx, sensor.id, now() - Duration::days(60), later)
        .await
        .unwrap();
    let values: Vec<f64> = left.iter().map(|r| r.value).collect();
    assert_eq!(values, vec![2.0, 3.0]);

    let err = engine
        .ingest_readings_at(&ctx, vec![NewReading::new(sensor.id, 4.0).at(now() - Duration::days(31))], now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::OutOfRange);
}

/// Checks every bucket against a recomputation from raw rows and returns the
/// number of readings they cover.
async fn recompute_and_compare(
    engine: &TelemetryEngine,
    ctx: &CallerContext,
    sensor_id: SensorId,
    buckets: Vec<AggregateBucket>,
) -> u64 {
    let mut total = 0;
    for bucket in buckets {
        let rows = engine
            .query_readings(ctx, sensor_id, bucket.bucket, bucket.bucket + Duration::hours(1))
            .await
            .unwrap();
        let expected = AggregateBucket::compute(&ctx.organization_id, sensor_id, bucket.bucket, &rows).unwrap();
        assert_eq!(bucket, expected);
        total += bucket.reading_count;
    }
    total
}

#[tokio::test]
async fn hourly_rollups_match_a_full_recomputation() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let mut rng = StdRng::seed_from_u64(7);
    let start = now() - Duration::hours(6);

    for _ in 0..10 {
        let batch = (0..50)
            .map(|_| {
                let offset = Duration::seconds(rng.gen_range(0..6 * 3600));
                NewReading::new(sensor.id, rng.gen_range(-20.0..120.0)).at(start + offset)
            })
            .collect();
        engine.ingest_readings_at(&ctx, batch, now()).await.unwrap();
    }
    completed(engine.refresh_aggregates_at(now()).await.unwrap());

    let buckets = engine
        .query_hourly_aggregate(&ctx, sensor.id, start, now())
        .await
        .unwrap();
    assert_eq!(buckets.len(), 6);
    assert_eq!(recompute_and_compare(&engine, &ctx, sensor.id, buckets).await, 500);

    // A late reading only touches its own bucket.
    let late = start + Duration::minutes(90);
    engine
        .ingest_readings_at(&ctx, vec![NewReading::new(sensor.id, 500.0).at(late)], now())
        .await
        .unwrap();
    let report = completed(engine.refresh_aggregates_at(now()).await.unwrap());
    assert_eq!(report.refreshed, 1);

    let buckets = engine
        .query_hourly_aggregate(&ctx, sensor.id, start, now())
        .await
        .unwrap();
    let touched = buckets.iter().find(|b| b.bucket == hour_bucket(late)).unwrap();
    assert_eq!(touched.max_value, 500.0);
    assert_eq!(recompute_and_compare(&engine, &ctx, sensor.id, buckets).await, 501);
}

#[tokio::test]
async fn command_retries_stop_at_max_retries() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let (other, other_sensor) = tenant(&engine, "globex").await;

    let command = engine
        .create_command(
            &ctx,
            NewCommand {
                sensor_id: sensor.id,
                command_type: "set_point".to_string(),
                payload: Some("{\"target\": 70}".to_string()),
                max_retries: 2,
                metadata: Default::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(command.user_id, ctx.user_id);

    let commands = engine.commands();
    for _ in 0..2 {
        commands.execute(&ctx, command.id).await.unwrap();
        commands.fail(&ctx, command.id, "timeout").await.unwrap();
        commands.retry(&ctx, command.id).await.unwrap();
    }
    commands.execute(&ctx, command.id).await.unwrap();
    let failed = commands.fail(&ctx, command.id, "timeout").await.unwrap();
    assert_eq!(failed.retry_count, 2);

    let err = commands.retry(&ctx, command.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorType::InvalidTransition);
    let (pending, retryable) = commands.dispatchable().await;
    assert!(pending.is_empty() && retryable.is_empty());

    let err = engine
        .create_command(
            &ctx,
            NewCommand {
                sensor_id: other_sensor.id,
                command_type: "reboot".to_string(),
                payload: None,
                max_retries: 0,
                metadata: Default::default(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::InvalidReference);
    assert_eq!(commands.get(&other, command.id).await.unwrap_err().kind(), ErrorType::NotFound);
}

#[tokio::test]
async fn compression_is_invisible_to_queries_and_late_writes_merge() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let cold = now() - Duration::days(10);
    let batch = (0..100)
        .map(|i| NewReading::new(sensor.id, i as f64 * 0.5).at(cold + Duration::minutes(i)))
        .collect();
    engine.ingest_readings_at(&ctx, batch, now()).await.unwrap();

    let window = (cold - Duration::hours(1), cold + Duration::days(1));
    let before = engine.query_readings(&ctx, sensor.id, window.0, window.1).await.unwrap();

    let report = completed(
        engine
            .run_compression_pass_at(now(), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!((report.processed, report.rows), (1, 100));
    assert!(engine
        .chunk_infos()
        .await
        .iter()
        .any(|c| c.state == ChunkState::Compressed));

    let after = engine.query_readings(&ctx, sensor.id, window.0, window.1).await.unwrap();
    assert_eq!(before, after);

    engine
        .ingest_readings_at(&ctx, vec![NewReading::new(sensor.id, -1.0).at(cold + Duration::hours(3))], now())
        .await
        .unwrap();
    let merged = engine.query_readings(&ctx, sensor.id, window.0, window.1).await.unwrap();
    assert_eq!(merged.len(), 101);
    assert!(engine
        .chunk_infos()
        .await
        .iter()
        .all(|c| c.state == ChunkState::Open));
}

#[tokio::test]
async fn deleting_an_organization_cascades_to_everything_it_owns() {
    let engine = engine().await;
    let (ctx, sensor) = tenant(&engine, "acme").await;
    let (other, other_sensor) = tenant(&engine, "globex").await;

    for (c, s) in [(&ctx, &sensor), (&other, &other_sensor)] {
        engine
            .ingest_readings_at(c, vec![NewReading::new(s.id, 95.0).at(now()), NewReading::new(s.id, 20.0).at(now())], now())
            .await
            .unwrap();
    }
    engine.evaluate_alerts().await;
    completed(engine.refresh_aggregates_at(now()).await.unwrap());
    engine
        .create_command(
            &ctx,
            NewCommand {
                sensor_id: sensor.id,
                command_type: "reboot".to_string(),
                payload: None,
                max_retries: 1,
                metadata: Default::default(),
            },
        )
        .await
        .unwrap();

    let err = engine
        .delete_organization(&other, &ctx.organization_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorType::NotFound);

    let purge = engine.delete_organization(&ctx, &ctx.organization_id).await.unwrap();
    assert_eq!((purge.assets, purge.sensors), (1, 1));
    assert_eq!((purge.readings, purge.alerts, purge.commands, purge.rollups), (2, 1, 1, 1));

    let window = (now() - Duration::hours(1), now() + Duration::minutes(1));
    assert!(engine
        .query_organization_readings(&ctx, window.0, window.1)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        engine.registry().get_organization(&ctx, &ctx.organization_id).await.unwrap_err().kind(),
        ErrorType::NotFound
    );

    let survivors = engine
        .query_readings(&other, other_sensor.id, window.0, window.1)
        .await
        .unwrap();
    assert_eq!(survivors.len(), 2);
    assert_eq!(engine.list_alerts(&other, &other.organization_id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lifecycle_passes_report_unsupported_without_time_series() {
    let mut configs = Configs::default();
    configs.storage.time_series = false;
    let engine = TelemetryEngine::open(configs).await.unwrap();
    assert!(!engine.capabilities().chunking);

    assert_eq!(engine.run_retention_pass().await.unwrap(), PassOutcome::Unsupported);
    assert_eq!(engine.run_compression_pass().await.unwrap(), PassOutcome::Unsupported);

    let (ctx, sensor) = tenant(&engine, "acme").await;
    engine
        .ingest_readings_at(&ctx, vec![NewReading::new(sensor.id, 12.0).at(now())], now())
        .await
        .unwrap();
    let report = completed(engine.refresh_aggregates_at(now()).await.unwrap());
    assert_eq!(report.refreshed, 1);
}

fn durable(dir: &tempfile::TempDir) -> Configs {
    let mut configs = Configs::default();
    configs.storage.database_url = Some(dir.path().join("telemetry.db").to_string_lossy().into_owned());
    configs
}

#[tokio::test]
async fn everything_committed_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ts = Utc::now() - Duration::minutes(5);
    let earlier = ts - Duration::seconds(1);

    let (ctx, sensor_id, first_ids) = {
        let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
        let (ctx, sensor) = tenant(&engine, "acme").await;
        let receipt = engine
            .ingest_readings(&ctx, vec![NewReading::new(sensor.id, 1.5).at(earlier), NewReading::new(sensor.id, 95.0).at(ts)])
            .await
            .unwrap();
        (ctx, sensor.id, receipt.reading_ids)
    };

    // Registry, readings and the evaluation backlog come back.
    {
        let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
        let restored = engine
            .query_readings(&ctx, sensor_id, earlier - Duration::minutes(1), ts + Duration::minutes(1))
            .await
            .unwrap();
        let values: Vec<f64> = restored.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.5, 95.0]);

        completed(engine.refresh_aggregates().await.unwrap());
        let buckets = engine
            .query_hourly_aggregate(&ctx, sensor_id, hour_bucket(earlier), hour_bucket(ts) + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(buckets.iter().map(|b| b.reading_count).sum::<u64>(), 2);

        assert_eq!(engine.evaluate_alerts().await, 1);
        let alerts = engine.list_alerts(&ctx, &ctx.organization_id, None).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].trigger_value, 95.0);
    }

    // Nothing is evaluated twice, and new ids stay clear of the old ones.
    let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
    assert_eq!(engine.evaluate_alerts().await, 0);
    assert_eq!(engine.list_alerts(&ctx, &ctx.organization_id, None).await.unwrap().len(), 1);
    let buckets = engine
        .query_hourly_aggregate(&ctx, sensor_id, hour_bucket(earlier), hour_bucket(ts) + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(buckets.iter().map(|b| b.reading_count).sum::<u64>(), 2);
    let receipt = engine
        .ingest_readings(&ctx, vec![NewReading::new(sensor_id, 3.0).at(ts)])
        .await
        .unwrap();
    assert!(receipt.reading_ids.iter().all(|id| first_ids.iter().all(|old| id > old)));
}

#[tokio::test]
async fn a_store_that_is_not_a_database_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let configs = durable(&dir);
    let garbage: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(dir.path().join("telemetry.db"), garbage).unwrap();

    assert!(TelemetryEngine::open(configs).await.is_err());
}

#[tokio::test]
async fn delete_racing_writers_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = {
        let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
        let (ctx, sensor) = tenant(&engine, "acme").await;
        let batch = |v: f64| vec![NewReading::new(sensor.id, v).at(Utc::now() - Duration::minutes(1))];
        engine.ingest_readings(&ctx, batch(95.0)).await.unwrap();

        let (purge, first, second, _) = tokio::join!(
            engine.delete_organization(&ctx, &ctx.organization_id),
            engine.ingest_readings(&ctx, batch(20.0)),
            engine.ingest_readings(&ctx, batch(96.0)),
            engine.refresh_aggregates(),
        );
        let purge = purge.unwrap();
        let accepted = [first, second].into_iter().filter(|r| r.is_ok()).count();
        assert_eq!(purge.readings, 1 + accepted);

        let err = engine.ingest_readings(&ctx, batch(1.0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorType::InvalidReference);
        assert_eq!(engine.evaluate_alerts().await, 0);
        ctx
    };

    let engine = TelemetryEngine::open(durable(&dir)).await.unwrap();
    assert!(!engine.registry().organization_exists(&ctx.organization_id).await);
    assert!(engine
        .query_organization_readings(&ctx, Utc::now() - Duration::hours(1), Utc::now())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(engine.evaluate_alerts().await, 0);
}

#[tokio::test]
async fn horizons_past_the_calendar_do_not_open() {
    let mut configs = Configs::default();
    configs.lifecycle.retention_days = 200_000_000;
    let err = TelemetryEngine::open(configs).await.unwrap_err();
    assert_eq!(err.kind(), ErrorType::Configuration);
}
