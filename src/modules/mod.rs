pub mod aggregate;
pub mod alerts;
pub mod commands;
pub mod credentials;
pub mod hypertable;
pub mod ingest;
pub mod lifecycle;
pub mod mqtt;
pub mod registry;
