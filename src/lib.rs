//! Multi-tenant IoT telemetry storage: chunked readings with retention,
//! compression and hourly rollups, plus the alert, command and credential
//! workflows built on top.

pub mod engine;
pub mod logger;
pub mod modules;
pub mod shared;

pub use engine::{OrganizationPurge, TelemetryEngine};
