use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::schema::ReadingKey;

pub type OrganizationId = String;
pub type UserId = String;
pub type AssetId = i64;
pub type SensorId = i64;
pub type ReadingId = i64;
pub type AlertId = i64;
pub type CommandId = i64;
pub type CredentialId = i64;

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionPlan {
    Free,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub owner_id: UserId,
    pub subscription_plan: SubscriptionPlan,
    pub storage_limit_gb: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub organization_id: OrganizationId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub location: String,
    pub status: AssetStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAsset {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub location: String,
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    Flow,
    Level,
    Vibration,
    Voltage,
    Current,
    Power,
    Other,
}

/// Transport the value arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Mqtt,
    OpcUa,
    Modbus,
    Http,
    Other,
}

impl Protocol {
    pub fn code(self) -> u8 {
        match self {
            Protocol::Mqtt => 0,
            Protocol::OpcUa => 1,
            Protocol::Modbus => 2,
            Protocol::Http => 3,
            Protocol::Other => 255,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Protocol::Mqtt,
            1 => Protocol::OpcUa,
            2 => Protocol::Modbus,
            3 => Protocol::Http,
            _ => Protocol::Other,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Mqtt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub organization_id: OrganizationId,
    pub asset_id: AssetId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: SensorType,
    pub unit: String,
    pub threshold_low: Option<f64>,
    pub threshold_high: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub sampling_interval_ms: u32,
    pub is_active: bool,
    pub protocol: Protocol,
    pub metadata: Metadata,
}

impl Sensor {
    /// Bound crossed by `value`, high checked first.
    pub fn crossed_threshold(&self, value: f64) -> Option<f64> {
        if let Some(high) = self.threshold_high {
            if value > high {
                return Some(high);
            }
        }
        if let Some(low) = self.threshold_low {
            if value < low {
                return Some(low);
            }
        }
        None
    }

    pub fn outside_physical_range(&self, value: f64) -> bool {
        self.min_value.map_or(false, |min| value < min)
            || self.max_value.map_or(false, |max| value > max)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSensor {
    pub asset_id: AssetId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: SensorType,
    pub unit: String,
    pub threshold_low: Option<f64>,
    pub threshold_high: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub sampling_interval_ms: u32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingQuality {
    Good,
    Uncertain,
    Bad,
    /// Supersedes an earlier reading for the same sensor and instant.
    Correction,
}

impl ReadingQuality {
    pub fn code(self) -> u8 {
        match self {
            ReadingQuality::Good => 0,
            ReadingQuality::Uncertain => 1,
            ReadingQuality::Bad => 2,
            ReadingQuality::Correction => 3,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ReadingQuality::Good,
            1 => ReadingQuality::Uncertain,
            3 => ReadingQuality::Correction,
            _ => ReadingQuality::Bad,
        }
    }
}

impl Default for ReadingQuality {
    fn default() -> Self {
        ReadingQuality::Good
    }
}

/// Immutable time-series fact. Physically keyed by `(id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub organization_id: OrganizationId,
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub protocol: Protocol,
    pub quality: ReadingQuality,
    pub notes: Option<String>,
    pub metadata: Option<Metadata>,
}

impl Reading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            id: self.id,
            timestamp: self.timestamp,
        }
    }
}

/// One row of an ingestion batch as submitted by a client or device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReading {
    pub sensor_id: SensorId,
    #[serde(default, deserialize_with = "crate::shared::deserialize_optional_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    pub value: f64,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub quality: ReadingQuality,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Ignored for stamping; only compared against the caller's organization.
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
}

impl NewReading {
    pub fn new(sensor_id: SensorId, value: f64) -> Self {
        NewReading {
            sensor_id,
            timestamp: None,
            value,
            protocol: Protocol::default(),
            quality: ReadingQuality::default(),
            notes: None,
            metadata: None,
            organization_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub organization_id: OrganizationId,
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
    pub trigger_value: f64,
    pub threshold_value: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<UserId>,
    pub notes: Option<String>,
    pub protocol: Protocol,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandStatus::Pending => "Pending",
            CommandStatus::Executing => "Executing",
            CommandStatus::Completed => "Completed",
            CommandStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub sensor_id: SensorId,
    pub command_type: String,
    pub payload: Option<String>,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCommand {
    pub sensor_id: SensorId,
    pub command_type: String,
    pub payload: Option<String>,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Credentials for an external endpoint. The secret only exists encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCredential {
    pub id: CredentialId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub endpoint_uri: String,
    pub client_id: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    #[serde(skip_serializing)]
    pub encryption_iv: String,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    pub name: String,
    pub endpoint_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialUpdate {
    pub endpoint_uri: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(low: Option<f64>, high: Option<f64>) -> Sensor {
        Sensor {
            id: 1,
            organization_id: "org-a".to_string(),
            asset_id: 1,
            name: "boiler temp".to_string(),
            type_: SensorType::Temperature,
            unit: "C".to_string(),
            threshold_low: low,
            threshold_high: high,
            min_value: Some(-40.0),
            max_value: Some(150.0),
            sampling_interval_ms: 1000,
            is_active: true,
            protocol: Protocol::Mqtt,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn threshold_crossing_reports_the_bound() {
        let s = sensor(Some(10.0), Some(90.0));
        assert_eq!(s.crossed_threshold(95.0), Some(90.0));
        assert_eq!(s.crossed_threshold(5.0), Some(10.0));
        assert_eq!(s.crossed_threshold(90.0), None);
        assert_eq!(s.crossed_threshold(10.0), None);
        assert_eq!(sensor(None, None).crossed_threshold(1e9), None);
    }

    #[test]
    fn physical_range_is_inclusive() {
        let s = sensor(None, None);
        assert!(!s.outside_physical_range(150.0));
        assert!(s.outside_physical_range(150.5));
        assert!(s.outside_physical_range(-41.0));
    }

    #[test]
    fn codes_survive_a_trip() {
        for p in [Protocol::Mqtt, Protocol::OpcUa, Protocol::Modbus, Protocol::Http, Protocol::Other] {
            assert_eq!(Protocol::from_code(p.code()), p);
        }
        for q in [
            ReadingQuality::Good,
            ReadingQuality::Uncertain,
            ReadingQuality::Bad,
            ReadingQuality::Correction,
        ] {
            assert_eq!(ReadingQuality::from_code(q.code()), q);
        }
    }
}
