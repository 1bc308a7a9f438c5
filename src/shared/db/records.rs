//! Row types for the store and their mapping to the domain models.
//!
//! Timestamps are stored as RFC 3339 text with nanoseconds, enums by their
//! serde name, metadata maps as JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{de::DeserializeOwned, Serialize};

use super::models::{
    Alert, Asset, Command, ConnectionCredential, Metadata, Organization, Protocol, Reading,
    ReadingQuality, Sensor,
};
use super::schema::*;
use crate::modules::aggregate::AggregateBucket;
use crate::modules::hypertable::ChunkId;
use crate::shared::errors::{AppError, AppResult};

pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn from_db_time(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("stored timestamp '{}': {}", raw, e)))
}

fn opt_time(raw: Option<String>) -> AppResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(from_db_time).transpose()
}

fn enum_to_db<T: Serialize>(value: &T) -> AppResult<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Ok(name),
        Ok(other) => Err(AppError::Internal(format!("{} is not a unit variant", other))),
        Err(e) => Err(AppError::from_json_err(e, "While encoding enum:")),
    }
}

fn enum_from_db<T: DeserializeOwned>(raw: &str) -> AppResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| AppError::from_json_err(e, "While decoding stored enum:"))
}

fn metadata_to_db(metadata: &Metadata) -> AppResult<String> {
    serde_json::to_string(metadata).map_err(|e| AppError::from_json_err(e, "While encoding metadata:"))
}

fn metadata_from_db(raw: &str) -> AppResult<Metadata> {
    serde_json::from_str(raw).map_err(|e| AppError::from_json_err(e, "While decoding stored metadata:"))
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn uncount(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn small(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = organizations, check_for_backend(diesel::sqlite::Sqlite))]
pub struct OrganizationRow {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub subscription_plan: String,
    pub storage_limit_gb: i64,
    pub created_at: String,
}

impl OrganizationRow {
    pub fn from_model(org: &Organization) -> AppResult<Self> {
        Ok(OrganizationRow {
            id: org.id.clone(),
            name: org.name.clone(),
            owner_id: org.owner_id.clone(),
            subscription_plan: enum_to_db(&org.subscription_plan)?,
            storage_limit_gb: i64::from(org.storage_limit_gb),
            created_at: to_db_time(org.created_at),
        })
    }

    pub fn into_model(self) -> AppResult<Organization> {
        Ok(Organization {
            subscription_plan: enum_from_db(&self.subscription_plan)?,
            storage_limit_gb: small(self.storage_limit_gb),
            created_at: from_db_time(&self.created_at)?,
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = assets, check_for_backend(diesel::sqlite::Sqlite))]
pub struct AssetRow {
    pub id: i64,
    pub organization_id: String,
    pub name: String,
    pub asset_type: String,
    pub location: String,
    pub status: String,
    pub last_seen: Option<String>,
    pub metadata: String,
}

impl AssetRow {
    pub fn from_model(asset: &Asset) -> AppResult<Self> {
        Ok(AssetRow {
            id: asset.id,
            organization_id: asset.organization_id.clone(),
            name: asset.name.clone(),
            asset_type: asset.type_.clone(),
            location: asset.location.clone(),
            status: enum_to_db(&asset.status)?,
            last_seen: asset.last_seen.map(to_db_time),
            metadata: metadata_to_db(&asset.metadata)?,
        })
    }

    pub fn into_model(self) -> AppResult<Asset> {
        Ok(Asset {
            status: enum_from_db(&self.status)?,
            last_seen: opt_time(self.last_seen)?,
            metadata: metadata_from_db(&self.metadata)?,
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            type_: self.asset_type,
            location: self.location,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = sensors, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SensorRow {
    pub id: i64,
    pub organization_id: String,
    pub asset_id: i64,
    pub name: String,
    pub sensor_type: String,
    pub unit: String,
    pub threshold_low: Option<f64>,
    pub threshold_high: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub sampling_interval_ms: i64,
    pub is_active: bool,
    pub protocol: i32,
    pub metadata: String,
}

impl SensorRow {
    pub fn from_model(sensor: &Sensor) -> AppResult<Self> {
        Ok(SensorRow {
            id: sensor.id,
            organization_id: sensor.organization_id.clone(),
            asset_id: sensor.asset_id,
            name: sensor.name.clone(),
            sensor_type: enum_to_db(&sensor.type_)?,
            unit: sensor.unit.clone(),
            threshold_low: sensor.threshold_low,
            threshold_high: sensor.threshold_high,
            min_value: sensor.min_value,
            max_value: sensor.max_value,
            sampling_interval_ms: i64::from(sensor.sampling_interval_ms),
            is_active: sensor.is_active,
            protocol: i32::from(sensor.protocol.code()),
            metadata: metadata_to_db(&sensor.metadata)?,
        })
    }

    pub fn into_model(self) -> AppResult<Sensor> {
        Ok(Sensor {
            type_: enum_from_db(&self.sensor_type)?,
            metadata: metadata_from_db(&self.metadata)?,
            sampling_interval_ms: small(self.sampling_interval_ms),
            protocol: Protocol::from_code(self.protocol as u8),
            id: self.id,
            organization_id: self.organization_id,
            asset_id: self.asset_id,
            name: self.name,
            unit: self.unit,
            threshold_low: self.threshold_low,
            threshold_high: self.threshold_high,
            min_value: self.min_value,
            max_value: self.max_value,
            is_active: self.is_active,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = readings, check_for_backend(diesel::sqlite::Sqlite))]
pub struct ReadingRow {
    pub id: i64,
    pub timestamp: String,
    pub organization_id: String,
    pub sensor_id: i64,
    pub value: f64,
    pub protocol: i32,
    pub quality: i32,
    pub notes: Option<String>,
    pub metadata: Option<String>,
    pub chunk_start: i64,
    pub chunk_partition: i32,
}

impl ReadingRow {
    pub fn from_model(reading: &Reading, chunk: ChunkId) -> AppResult<Self> {
        Ok(ReadingRow {
            id: reading.id,
            timestamp: to_db_time(reading.timestamp),
            organization_id: reading.organization_id.clone(),
            sensor_id: reading.sensor_id,
            value: reading.value,
            protocol: i32::from(reading.protocol.code()),
            quality: i32::from(reading.quality.code()),
            notes: reading.notes.clone(),
            metadata: reading.metadata.as_ref().map(metadata_to_db).transpose()?,
            chunk_start: chunk.range_start.timestamp(),
            chunk_partition: i32::from(chunk.partition),
        })
    }

    pub fn into_model(self) -> AppResult<Reading> {
        Ok(Reading {
            timestamp: from_db_time(&self.timestamp)?,
            protocol: Protocol::from_code(self.protocol as u8),
            quality: ReadingQuality::from_code(self.quality as u8),
            metadata: self.metadata.as_deref().map(metadata_from_db).transpose()?,
            id: self.id,
            organization_id: self.organization_id,
            sensor_id: self.sensor_id,
            value: self.value,
            notes: self.notes,
        })
    }

    /// Outbox entry written in the same transaction as the reading.
    pub fn pending_evaluation(&self) -> PendingEvaluationRow {
        PendingEvaluationRow {
            organization_id: self.organization_id.clone(),
            reading_id: self.id,
            timestamp: self.timestamp.clone(),
            chunk_start: self.chunk_start,
            chunk_partition: self.chunk_partition,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = chunks, check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChunkRow {
    pub chunk_start: i64,
    pub chunk_partition: i32,
    pub compressed: bool,
}

impl ChunkRow {
    pub fn new(id: ChunkId, compressed: bool) -> Self {
        ChunkRow {
            chunk_start: id.range_start.timestamp(),
            chunk_partition: i32::from(id.partition),
            compressed,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = pending_evaluations, check_for_backend(diesel::sqlite::Sqlite))]
pub struct PendingEvaluationRow {
    pub organization_id: String,
    pub reading_id: i64,
    pub timestamp: String,
    pub chunk_start: i64,
    pub chunk_partition: i32,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = alerts, check_for_backend(diesel::sqlite::Sqlite))]
pub struct AlertRow {
    pub id: i64,
    pub organization_id: String,
    pub sensor_id: i64,
    pub reading_id: i64,
    pub timestamp: String,
    pub severity: String,
    pub message: String,
    pub trigger_value: f64,
    pub threshold_value: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<String>,
    pub acknowledged_by: Option<String>,
    pub notes: Option<String>,
    pub protocol: i32,
    pub metadata: String,
}

impl AlertRow {
    pub fn from_model(alert: &Alert, reading_id: i64) -> AppResult<Self> {
        Ok(AlertRow {
            id: alert.id,
            organization_id: alert.organization_id.clone(),
            sensor_id: alert.sensor_id,
            reading_id,
            timestamp: to_db_time(alert.timestamp),
            severity: enum_to_db(&alert.severity)?,
            message: alert.message.clone(),
            trigger_value: alert.trigger_value,
            threshold_value: alert.threshold_value,
            acknowledged: alert.acknowledged,
            acknowledged_at: alert.acknowledged_at.map(to_db_time),
            acknowledged_by: alert.acknowledged_by.clone(),
            notes: alert.notes.clone(),
            protocol: i32::from(alert.protocol.code()),
            metadata: metadata_to_db(&alert.metadata)?,
        })
    }

    /// The alert plus the reading it was raised for.
    pub fn into_model(self) -> AppResult<(Alert, i64)> {
        let alert = Alert {
            timestamp: from_db_time(&self.timestamp)?,
            severity: enum_from_db(&self.severity)?,
            acknowledged_at: opt_time(self.acknowledged_at)?,
            protocol: Protocol::from_code(self.protocol as u8),
            metadata: metadata_from_db(&self.metadata)?,
            id: self.id,
            organization_id: self.organization_id,
            sensor_id: self.sensor_id,
            message: self.message,
            trigger_value: self.trigger_value,
            threshold_value: self.threshold_value,
            acknowledged: self.acknowledged,
            acknowledged_by: self.acknowledged_by,
            notes: self.notes,
        };
        Ok((alert, self.reading_id))
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = commands, check_for_backend(diesel::sqlite::Sqlite))]
pub struct CommandRow {
    pub id: i64,
    pub organization_id: String,
    pub user_id: String,
    pub sensor_id: i64,
    pub command_type: String,
    pub payload: Option<String>,
    pub status: String,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub response: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub metadata: String,
}

impl CommandRow {
    pub fn from_model(command: &Command) -> AppResult<Self> {
        Ok(CommandRow {
            id: command.id,
            organization_id: command.organization_id.clone(),
            user_id: command.user_id.clone(),
            sensor_id: command.sensor_id,
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            status: enum_to_db(&command.status)?,
            created_at: to_db_time(command.created_at),
            executed_at: command.executed_at.map(to_db_time),
            completed_at: command.completed_at.map(to_db_time),
            error_message: command.error_message.clone(),
            response: command.response.clone(),
            retry_count: i64::from(command.retry_count),
            max_retries: i64::from(command.max_retries),
            metadata: metadata_to_db(&command.metadata)?,
        })
    }

    pub fn into_model(self) -> AppResult<Command> {
        Ok(Command {
            status: enum_from_db(&self.status)?,
            created_at: from_db_time(&self.created_at)?,
            executed_at: opt_time(self.executed_at)?,
            completed_at: opt_time(self.completed_at)?,
            retry_count: small(self.retry_count),
            max_retries: small(self.max_retries),
            metadata: metadata_from_db(&self.metadata)?,
            id: self.id,
            organization_id: self.organization_id,
            user_id: self.user_id,
            sensor_id: self.sensor_id,
            command_type: self.command_type,
            payload: self.payload,
            error_message: self.error_message,
            response: self.response,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = connection_credentials, check_for_backend(diesel::sqlite::Sqlite))]
pub struct CredentialRow {
    pub id: i64,
    pub organization_id: String,
    pub name: String,
    pub endpoint_uri: String,
    pub client_id: Option<String>,
    pub username: String,
    pub encrypted_password: String,
    pub encryption_iv: String,
    pub protocol: i32,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub is_active: bool,
}

impl CredentialRow {
    pub fn from_model(credential: &ConnectionCredential) -> Self {
        CredentialRow {
            id: credential.id,
            organization_id: credential.organization_id.clone(),
            name: credential.name.clone(),
            endpoint_uri: credential.endpoint_uri.clone(),
            client_id: credential.client_id.clone(),
            username: credential.username.clone(),
            encrypted_password: credential.encrypted_password.clone(),
            encryption_iv: credential.encryption_iv.clone(),
            protocol: i32::from(credential.protocol.code()),
            created_at: to_db_time(credential.created_at),
            last_used_at: credential.last_used_at.map(to_db_time),
            is_active: credential.is_active,
        }
    }

    pub fn into_model(self) -> AppResult<ConnectionCredential> {
        Ok(ConnectionCredential {
            protocol: Protocol::from_code(self.protocol as u8),
            created_at: from_db_time(&self.created_at)?,
            last_used_at: opt_time(self.last_used_at)?,
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            endpoint_uri: self.endpoint_uri,
            client_id: self.client_id,
            username: self.username,
            encrypted_password: self.encrypted_password,
            encryption_iv: self.encryption_iv,
            is_active: self.is_active,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = readings_hourly, check_for_backend(diesel::sqlite::Sqlite))]
pub struct HourlyRow {
    pub organization_id: String,
    pub sensor_id: i64,
    pub bucket: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub reading_count: i64,
}

impl HourlyRow {
    pub fn from_model(bucket: &AggregateBucket) -> Self {
        HourlyRow {
            organization_id: bucket.organization_id.clone(),
            sensor_id: bucket.sensor_id,
            bucket: to_db_time(bucket.bucket),
            avg_value: bucket.avg_value,
            min_value: bucket.min_value,
            max_value: bucket.max_value,
            reading_count: count(bucket.reading_count),
        }
    }

    pub fn into_model(self) -> AppResult<AggregateBucket> {
        Ok(AggregateBucket {
            bucket: from_db_time(&self.bucket)?,
            reading_count: uncount(self.reading_count),
            organization_id: self.organization_id,
            sensor_id: self.sensor_id,
            avg_value: self.avg_value,
            min_value: self.min_value,
            max_value: self.max_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stored_time_sorts_like_time() {
        let a = Utc.with_ymd_and_hms(2025, 11, 19, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        let c = a + chrono::Duration::hours(14);
        let mut stored = vec![to_db_time(c), to_db_time(b), to_db_time(a)];
        stored.sort();
        assert_eq!(stored, vec![to_db_time(a), to_db_time(b), to_db_time(c)]);
        assert_eq!(from_db_time(&to_db_time(b)).unwrap(), b);
    }

    #[test]
    fn enums_are_stored_by_name() {
        use super::super::models::{AlertSeverity, CommandStatus};
        assert_eq!(enum_to_db(&CommandStatus::Executing).unwrap(), "Executing");
        assert_eq!(enum_from_db::<AlertSeverity>("Critical").unwrap(), AlertSeverity::Critical);
        assert!(enum_from_db::<AlertSeverity>("Apocalyptic").is_err());
    }
}
