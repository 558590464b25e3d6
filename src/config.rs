//! Configuration management for meterlog
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `METERLOG__SECTION__KEY` environment variables. Every section carries
//! `#[serde(default)]`, so any key may be omitted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::history::{PollConfig, RetrievalMode};
use crate::modbus::registers::MAX_RECORDS_PER_WINDOW;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Collection cycle settings
    pub collector: CollectorConfig,
    /// Modbus transport settings
    pub modbus: ModbusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// JSON file holding the meter inventory and cursors
    pub inventory_path: PathBuf,
    /// Default folder for CSV output
    pub output_dir: PathBuf,
    /// Period of scheduled collection in `serve` mode (0 = disabled)
    pub interval_secs: u64,
    pub mode: RetrievalMode,
    /// Upper bound on records per cycle in catch-up mode (0 = unlimited)
    pub max_records_per_cycle: u32,
    /// Records per window, 1..=8
    pub max_window_records: u8,
    /// CSV field delimiter, a single ASCII character
    pub csv_delimiter: char,
    /// Check and correct meter clocks before each cycle
    pub sync_time: bool,
    pub allowed_drift_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Default TCP port for meters that do not set one
    pub port: u16,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub ready_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            metrics_enabled: true,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            inventory_path: PathBuf::from("meters.json"),
            output_dir: PathBuf::from("./data"),
            interval_secs: 900,
            mode: RetrievalMode::CatchUp,
            max_records_per_cycle: 0,
            max_window_records: MAX_RECORDS_PER_WINDOW,
            csv_delimiter: ',',
            sync_time: false,
            allowed_drift_secs: 60,
        }
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: 502,
            request_timeout_ms: 3000,
            poll_interval_ms: 200,
            ready_timeout_ms: 5000,
        }
    }
}

impl ModbusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.ready_timeout_ms),
        }
    }
}

impl Config {
    /// Reject values the collector cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_RECORDS_PER_WINDOW).contains(&self.collector.max_window_records) {
            anyhow::bail!(
                "collector.max_window_records must be between 1 and {}, got {}",
                MAX_RECORDS_PER_WINDOW,
                self.collector.max_window_records
            );
        }
        if !self.collector.csv_delimiter.is_ascii() {
            anyhow::bail!(
                "collector.csv_delimiter must be ASCII, got {:?}",
                self.collector.csv_delimiter
            );
        }
        if self.modbus.poll_interval_ms == 0 {
            anyhow::bail!("modbus.poll_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Resolve the config file path from an explicit argument or the environment
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(|| {
        std::env::var("METERLOG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("meterlog.yaml"))
    })
}

/// Load configuration from defaults, file and environment
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!("Config file {} not found, using defaults", path.display());
    }

    let settings = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Yaml)
                .required(false),
        )
        .add_source(
            config::Environment::with_prefix("METERLOG")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let config: Config = settings
        .try_deserialize()
        .with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}
