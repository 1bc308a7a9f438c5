use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::db::models::{Command, CommandId, NewReading, OrganizationId, SensorId};

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Where an inbound publish belongs. The organization segment is trusted:
/// the broker's ACL only lets a device publish under its own tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Readings { organization_id: OrganizationId },
    CommandResponse { organization_id: OrganizationId, command_id: CommandId },
}

impl Topic {
    pub fn readings_filter(prefix: &str) -> String {
        format!("{}/+/readings", prefix)
    }

    pub fn responses_filter(prefix: &str) -> String {
        format!("{}/+/commands/+/response", prefix)
    }

    pub fn command(prefix: &str, organization_id: &str, sensor_id: SensorId) -> String {
        format!("{}/{}/sensors/{}/commands", prefix, organization_id, sensor_id)
    }

    pub fn parse(prefix: &str, topic: &str) -> Option<Topic> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [org, "readings"] if !org.is_empty() => Some(Topic::Readings {
                organization_id: org.to_string(),
            }),
            [org, "commands", id, "response"] if !org.is_empty() => Some(Topic::CommandResponse {
                organization_id: org.to_string(),
                command_id: id.parse().ok()?,
            }),
            _ => None,
        }
    }
}

/// Devices send a wrapped batch, a bare array or a single reading.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReadingsPayload {
    Batch { readings: Vec<NewReading> },
    Many(Vec<NewReading>),
    One(NewReading),
}

impl ReadingsPayload {
    pub fn into_batch(self) -> Vec<NewReading> {
        match self {
            ReadingsPayload::Batch { readings } => readings,
            ReadingsPayload::Many(readings) => readings,
            ReadingsPayload::One(reading) => vec![reading],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandDispatch {
    #[serde(rename = "commandId")]
    pub command_id: CommandId,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Option<String>,
    pub attempt: u32,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

impl From<&Command> for CommandDispatch {
    fn from(command: &Command) -> Self {
        CommandDispatch {
            command_id: command.id,
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            attempt: command.retry_count + 1,
            issued_at: command.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
