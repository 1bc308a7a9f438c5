use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::errors::{AppError, AppResult};

/// A century. Keeps every horizon well inside the `DateTime` range.
const MAX_LIFECYCLE_DAYS: u32 = 36_500;
const MAX_CHUNK_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;
const MAX_FUTURE_SKEW_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_PARTITIONS: u16 = 1024;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Configs {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_path: PathBuf,
}

impl Configs {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config_content = fs::read_to_string(&path)
            .map_err(|e| AppError::Configuration(format!("reading {}: {}", path.as_ref().display(), e)))?;
        let mut configs = Self::from_toml(&config_content)?;
        configs.config_path = path.as_ref().to_path_buf();
        Ok(configs)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let configs: Configs =
            toml::from_str(content).map_err(|e| AppError::Configuration(e.to_string()))?;
        configs.validate()?;
        Ok(configs)
    }

    /// Loads from `TELEMETRY_CONFIG` when set, defaults otherwise.
    pub fn from_env() -> AppResult<Self> {
        match std::env::var("TELEMETRY_CONFIG") {
            Ok(path) => Self::load_from_file(path),
            Err(_) => {
                log::info!("TELEMETRY_CONFIG not set, using default configuration");
                Ok(Configs::default())
            }
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let storage = &self.storage;
        let lifecycle = &self.lifecycle;
        if storage.partitions == 0 || storage.partitions > MAX_PARTITIONS {
            return Err(AppError::Configuration(format!(
                "storage.partitions must be within 1..={}",
                MAX_PARTITIONS
            )));
        }
        if storage.chunk_interval_secs == 0 || storage.chunk_interval_secs > MAX_CHUNK_INTERVAL_SECS {
            return Err(AppError::Configuration(format!(
                "storage.chunk_interval_secs must be within 1..={}",
                MAX_CHUNK_INTERVAL_SECS
            )));
        }
        if storage.max_future_skew_secs > MAX_FUTURE_SKEW_SECS {
            return Err(AppError::Configuration(format!(
                "storage.max_future_skew_secs must be at most {}",
                MAX_FUTURE_SKEW_SECS
            )));
        }
        if storage.pool_size == 0 {
            return Err(AppError::Configuration("storage.pool_size must be at least 1".into()));
        }
        if lifecycle.retention_days == 0 || lifecycle.retention_days > MAX_LIFECYCLE_DAYS {
            return Err(AppError::Configuration(format!(
                "lifecycle.retention_days must be within 1..={}",
                MAX_LIFECYCLE_DAYS
            )));
        }
        if lifecycle.compression_after_days > MAX_LIFECYCLE_DAYS {
            return Err(AppError::Configuration(format!(
                "lifecycle.compression_after_days must be at most {}",
                MAX_LIFECYCLE_DAYS
            )));
        }
        Ok(())
    }

    pub fn save_to_file(&self) -> AppResult<()> {
        let config_content =
            toml::to_string_pretty(self).map_err(|e| AppError::Configuration(e.to_string()))?;
        let mut file = fs::File::create(&self.config_path)
            .map_err(|e| AppError::from_io_err(e, "While saving configuration:"))?;
        file.write_all(config_content.as_bytes())
            .map_err(|e| AppError::from_io_err(e, "While saving configuration:"))?;
        Ok(())
    }

    pub fn update_and_save<F>(&mut self, updater: F) -> AppResult<()>
    where
        F: FnOnce(&mut Self),
    {
        updater(self);
        self.validate()?;
        self.save_to_file()?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// When false the readings table is a single unchunked segment per partition.
    pub time_series: bool,
    pub chunk_interval_secs: u64,
    pub partitions: u16,
    /// SQLite database file. Without one nothing survives a restart.
    pub database_url: Option<String>,
    pub pool_size: u32,
    /// How far past "now" a reading timestamp may be.
    pub max_future_skew_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            time_series: true,
            chunk_interval_secs: 24 * 60 * 60,
            partitions: 4,
            database_url: None,
            pool_size: 4,
            max_future_skew_secs: 300,
        }
    }
}

impl StorageConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::seconds(self.chunk_interval_secs as i64)
    }

    pub fn max_future_skew(&self) -> Duration {
        Duration::seconds(self.max_future_skew_secs as i64)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub retention_days: u32,
    pub compression_after_days: u32,
    pub retention_schedule_secs: u64,
    pub compression_schedule_secs: u64,
    pub aggregate_refresh_secs: u64,
    pub command_dispatch_secs: u64,
    /// A pass still running after this long stops at the next chunk boundary.
    pub pass_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            retention_days: 30,
            compression_after_days: 7,
            retention_schedule_secs: 60 * 60,
            compression_schedule_secs: 60 * 60,
            aggregate_refresh_secs: 5 * 60,
            command_dispatch_secs: 5,
            pass_timeout_secs: 10 * 60,
        }
    }
}

impl LifecycleConfig {
    pub fn retention_horizon(&self) -> Duration {
        Duration::days(self.retention_days as i64)
    }

    pub fn compression_after(&self) -> Duration {
        Duration::days(self.compression_after_days as i64)
    }

    pub fn pass_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pass_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u16,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_client_id() -> String {
    "telemetry-ingest".to_string()
}

fn default_topic_prefix() -> String {
    "tenants".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lifecycle_design() {
        let c = Configs::default();
        assert_eq!(c.storage.chunk_interval(), Duration::days(1));
        assert_eq!(c.storage.partitions, 4);
        assert_eq!(c.lifecycle.retention_horizon(), Duration::days(30));
        assert_eq!(c.lifecycle.compression_after(), Duration::days(7));
        assert!(c.mqtt.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = Configs::from_toml(
            r#"
            [lifecycle]
            retention_days = 90

            [mqtt]
            broker = "localhost"
            port = 1883
            keep_alive = 30
            "#,
        )
        .unwrap();
        assert_eq!(c.lifecycle.retention_days, 90);
        assert_eq!(c.lifecycle.compression_after_days, 7);
        let mqtt = c.mqtt.unwrap();
        assert_eq!(mqtt.topic_prefix, "tenants");
        assert_eq!(mqtt.client_id, "telemetry-ingest");
    }

    #[test]
    fn updated_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let mut c = Configs::load_from_file(&path).unwrap();
        c.update_and_save(|c| c.lifecycle.retention_days = 14).unwrap();

        let reloaded = Configs::load_from_file(&path).unwrap();
        assert_eq!(reloaded.lifecycle.retention_days, 14);
        assert_eq!(reloaded.logging.level, "debug");
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let err = Configs::from_toml("[storage]\npartitions = 0\n").unwrap_err();
        assert!(err.to_string().contains("partitions"));
    }

    #[test]
    fn horizons_past_the_calendar_are_rejected() {
        for toml in [
            "[lifecycle]\nretention_days = 200000000\n",
            "[lifecycle]\ncompression_after_days = 4000000000\n",
            "[storage]\nchunk_interval_secs = 18446744073709551615\n",
            "[storage]\nmax_future_skew_secs = 9223372036854775807\n",
        ] {
            let err = Configs::from_toml(toml).unwrap_err();
            assert_eq!(err.kind(), crate::shared::errors::ErrorType::Configuration, "{}", toml);
        }
        assert!(Configs::from_toml("[lifecycle]\nretention_days = 3650\n").is_ok());
    }
}
