//! Tables of the telemetry store. `migrations.rs` creates them; the in-memory
//! tables at the bottom mirror their composite indexes as ordered-set keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{
    AlertId, CommandId, CommandStatus, OrganizationId, ReadingId, SensorId, UserId,
};

diesel::table! {
    organizations (id) {
        id -> Text,
        name -> Text,
        owner_id -> Text,
        subscription_plan -> Text,
        storage_limit_gb -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    assets (id) {
        id -> BigInt,
        organization_id -> Text,
        name -> Text,
        asset_type -> Text,
        location -> Text,
        status -> Text,
        last_seen -> Nullable<Text>,
        metadata -> Text,
    }
}

diesel::table! {
    sensors (id) {
        id -> BigInt,
        organization_id -> Text,
        asset_id -> BigInt,
        name -> Text,
        sensor_type -> Text,
        unit -> Text,
        threshold_low -> Nullable<Double>,
        threshold_high -> Nullable<Double>,
        min_value -> Nullable<Double>,
        max_value -> Nullable<Double>,
        sampling_interval_ms -> BigInt,
        is_active -> Bool,
        protocol -> Integer,
        metadata -> Text,
    }
}

// Hypertable. Rows carry their chunk so retention deletes whole chunks.
diesel::table! {
    readings (id, timestamp) {
        id -> BigInt,
        timestamp -> Text,
        organization_id -> Text,
        sensor_id -> BigInt,
        value -> Double,
        protocol -> Integer,
        quality -> Integer,
        notes -> Nullable<Text>,
        metadata -> Nullable<Text>,
        chunk_start -> BigInt,
        chunk_partition -> Integer,
    }
}

// Chunk catalog.
diesel::table! {
    chunks (chunk_start, chunk_partition) {
        chunk_start -> BigInt,
        chunk_partition -> Integer,
        compressed -> Bool,
    }
}

// Committed readings not yet checked against thresholds.
diesel::table! {
    pending_evaluations (organization_id, reading_id) {
        organization_id -> Text,
        reading_id -> BigInt,
        timestamp -> Text,
        chunk_start -> BigInt,
        chunk_partition -> Integer,
    }
}

diesel::table! {
    alerts (id) {
        id -> BigInt,
        organization_id -> Text,
        sensor_id -> BigInt,
        reading_id -> BigInt,
        timestamp -> Text,
        severity -> Text,
        message -> Text,
        trigger_value -> Double,
        threshold_value -> Nullable<Double>,
        acknowledged -> Bool,
        acknowledged_at -> Nullable<Text>,
        acknowledged_by -> Nullable<Text>,
        notes -> Nullable<Text>,
        protocol -> Integer,
        metadata -> Text,
    }
}

diesel::table! {
    commands (id) {
        id -> BigInt,
        organization_id -> Text,
        user_id -> Text,
        sensor_id -> BigInt,
        command_type -> Text,
        payload -> Nullable<Text>,
        status -> Text,
        created_at -> Text,
        executed_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
        error_message -> Nullable<Text>,
        response -> Nullable<Text>,
        retry_count -> BigInt,
        max_retries -> BigInt,
        metadata -> Text,
    }
}

diesel::table! {
    connection_credentials (id) {
        id -> BigInt,
        organization_id -> Text,
        name -> Text,
        endpoint_uri -> Text,
        client_id -> Nullable<Text>,
        username -> Text,
        encrypted_password -> Text,
        encryption_iv -> Text,
        protocol -> Integer,
        created_at -> Text,
        last_used_at -> Nullable<Text>,
        is_active -> Bool,
    }
}

// Continuous aggregate, one row per (organization, sensor, hour).
diesel::table! {
    readings_hourly (organization_id, sensor_id, bucket) {
        organization_id -> Text,
        sensor_id -> BigInt,
        bucket -> Text,
        avg_value -> Double,
        min_value -> Double,
        max_value -> Double,
        reading_count -> BigInt,
    }
}

/// Physical primary key of a reading. The timestamp is part of the key so a
/// row can be located inside its time chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingKey {
    pub id: ReadingId,
    pub timestamp: DateTime<Utc>,
}

/// `ix_readings_org_sensor_timestamp`.
pub type SensorTimeIndexKey = (OrganizationId, SensorId, DateTime<Utc>, ReadingId);

/// `ix_readings_org_timestamp`.
pub type OrganizationTimeIndexKey = (OrganizationId, DateTime<Utc>, ReadingId);

/// `ix_alerts_org_acknowledged_timestamp`.
pub type AlertIndexKey = (OrganizationId, bool, DateTime<Utc>, AlertId);

/// `ix_commands_org_status_created_at`.
pub type CommandStatusIndexKey = (OrganizationId, CommandStatus, DateTime<Utc>, CommandId);

/// `ix_commands_org_user`.
pub type CommandUserIndexKey = (OrganizationId, UserId, CommandId);
