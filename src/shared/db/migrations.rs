use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use diesel::sqlite::SqliteConnection;

use crate::shared::errors::{AppError, AppResult};

/// Applied in order; `PRAGMA user_version` records how many ran.
pub const MIGRATIONS: &[&str] = &[V1];

// language=sql
const V1: &str = r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT NOT NULL PRIMARY KEY,
        name TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        subscription_plan TEXT NOT NULL,
        storage_limit_gb INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS assets (
        id INTEGER NOT NULL PRIMARY KEY,
        organization_id TEXT NOT NULL,
        name TEXT NOT NULL,
        asset_type TEXT NOT NULL,
        location TEXT NOT NULL,
        status TEXT NOT NULL,
        last_seen TEXT,
        metadata TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ix_assets_org ON assets (organization_id);

    CREATE TABLE IF NOT EXISTS sensors (
        id INTEGER NOT NULL PRIMARY KEY,
        organization_id TEXT NOT NULL,
        asset_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        sensor_type TEXT NOT NULL,
        unit TEXT NOT NULL,
        threshold_low REAL,
        threshold_high REAL,
        min_value REAL,
        max_value REAL,
        sampling_interval_ms INTEGER NOT NULL,
        is_active INTEGER NOT NULL,
        protocol INTEGER NOT NULL,
        metadata TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ix_sensors_org ON sensors (organization_id);

    -- timestamps are RFC 3339 with nanoseconds, so text order is time order
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        organization_id TEXT NOT NULL,
        sensor_id INTEGER NOT NULL,
        value REAL NOT NULL,
        protocol INTEGER NOT NULL,
        quality INTEGER NOT NULL,
        notes TEXT,
        metadata TEXT,
        chunk_start INTEGER NOT NULL,
        chunk_partition INTEGER NOT NULL,
        PRIMARY KEY (id, timestamp)
    );
    CREATE INDEX IF NOT EXISTS ix_readings_org_sensor_timestamp
        ON readings (organization_id, sensor_id, timestamp);
    CREATE INDEX IF NOT EXISTS ix_readings_org_timestamp
        ON readings (organization_id, timestamp);
    CREATE INDEX IF NOT EXISTS ix_readings_chunk
        ON readings (chunk_start, chunk_partition);

    CREATE TABLE IF NOT EXISTS chunks (
        chunk_start INTEGER NOT NULL,
        chunk_partition INTEGER NOT NULL,
        compressed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chunk_start, chunk_partition)
    );

    CREATE TABLE IF NOT EXISTS pending_evaluations (
        organization_id TEXT NOT NULL,
        reading_id INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        chunk_start INTEGER NOT NULL,
        chunk_partition INTEGER NOT NULL,
        PRIMARY KEY (organization_id, reading_id)
    );

    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER NOT NULL PRIMARY KEY,
        organization_id TEXT NOT NULL,
        sensor_id INTEGER NOT NULL,
        reading_id INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        trigger_value REAL NOT NULL,
        threshold_value REAL,
        acknowledged INTEGER NOT NULL,
        acknowledged_at TEXT,
        acknowledged_by TEXT,
        notes TEXT,
        protocol INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        UNIQUE (organization_id, reading_id)
    );
    CREATE INDEX IF NOT EXISTS ix_alerts_org_acknowledged_timestamp
        ON alerts (organization_id, acknowledged, timestamp);

    CREATE TABLE IF NOT EXISTS commands (
        id INTEGER NOT NULL PRIMARY KEY,
        organization_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        sensor_id INTEGER NOT NULL,
        command_type TEXT NOT NULL,
        payload TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        executed_at TEXT,
        completed_at TEXT,
        error_message TEXT,
        response TEXT,
        retry_count INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        metadata TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ix_commands_org_status_created_at
        ON commands (organization_id, status, created_at);
    CREATE INDEX IF NOT EXISTS ix_commands_org_user
        ON commands (organization_id, user_id);

    CREATE TABLE IF NOT EXISTS connection_credentials (
        id INTEGER NOT NULL PRIMARY KEY,
        organization_id TEXT NOT NULL,
        name TEXT NOT NULL,
        endpoint_uri TEXT NOT NULL,
        client_id TEXT,
        username TEXT NOT NULL,
        encrypted_password TEXT NOT NULL,
        encryption_iv TEXT NOT NULL,
        protocol INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        last_used_at TEXT,
        is_active INTEGER NOT NULL,
        UNIQUE (organization_id, name)
    );

    CREATE TABLE IF NOT EXISTS readings_hourly (
        organization_id TEXT NOT NULL,
        sensor_id INTEGER NOT NULL,
        bucket TEXT NOT NULL,
        avg_value REAL NOT NULL,
        min_value REAL NOT NULL,
        max_value REAL NOT NULL,
        reading_count INTEGER NOT NULL,
        PRIMARY KEY (organization_id, sensor_id, bucket)
    );
"#;

#[derive(QueryableByName)]
struct UserVersion {
    #[diesel(sql_type = Integer)]
    user_version: i32,
}

/// Brings the schema up to date. Returns the resulting version.
pub fn run(conn: &mut SqliteConnection) -> AppResult<usize> {
    // Also the first statement that reads the file, so a foreign file fails here.
    conn.batch_execute("PRAGMA journal_mode = WAL;")
        .map_err(|e| AppError::from_diesel_err(e, "While opening store:"))?;

    let current = diesel::sql_query("PRAGMA user_version")
        .get_result::<UserVersion>(conn)
        .map_err(|e| AppError::from_diesel_err(e, "While reading schema version:"))?
        .user_version
        .max(0) as usize;
    if current > MIGRATIONS.len() {
        return Err(AppError::Configuration(format!(
            "store schema version {} is newer than this build ({})",
            current,
            MIGRATIONS.len()
        )));
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            conn.batch_execute(sql)?;
            conn.batch_execute(&format!("PRAGMA user_version = {};", version))
        })
        .map_err(|e| AppError::from_diesel_err(e, "While migrating store:"))?;
        log::info!("store migrated to version {}", version);
    }
    Ok(MIGRATIONS.len())
}
