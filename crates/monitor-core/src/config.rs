use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};
use crate::types::Granularity;

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub refresh: RefreshConfig,
    pub server: ServerConfig,
    pub pricing: PricingConfig,
}

impl AppConfig {
    /// Load configuration from default path (~/.config/chat-monitor/config.toml),
    /// falling back to defaults if the file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write current configuration to the default path.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-monitor")
            .join("config.toml")
    }

    /// Default directory for the JSON-lines record files.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-monitor")
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.refresh.interval_secs == 0 {
            return Err(MonitorError::Config("refresh.interval_secs must be > 0".into()));
        }
        if self.refresh.histogram_bins == 0 {
            return Err(MonitorError::Config("refresh.histogram_bins must be > 0".into()));
        }
        if !self.refresh.default_scale.is_live_switchable() {
            return Err(MonitorError::Config(format!(
                "refresh.default_scale '{}' must be minute, hour or day",
                self.refresh.default_scale
            )));
        }
        if self.source.time_range_hours == 0 {
            return Err(MonitorError::Config("source.time_range_hours must be > 0".into()));
        }
        if self.server.client_buffer == 0 {
            return Err(MonitorError::Config("server.client_buffer must be > 0".into()));
        }
        Ok(())
    }
}

/// Where raw records come from and how much of them to read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory holding the JSON-lines record files (None = data_dir()).
    pub data_dir: Option<PathBuf>,
    pub sessions_file: String,
    pub messages_file: String,
    /// Page size for message reads during a collection pass.
    pub batch_size: usize,
    /// Maximum sessions read per refresh.
    pub session_limit: usize,
    pub messages_per_session_limit: usize,
    /// Size of the query window, in hours back from now.
    pub time_range_hours: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sessions_file: "sessions.jsonl".into(),
            messages_file: "messages.jsonl".into(),
            batch_size: 100,
            session_limit: 1000,
            messages_per_session_limit: 100,
            time_range_hours: 24,
        }
    }
}

impl SourceConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(AppConfig::data_dir)
    }
}

/// Refresh loop cadence and aggregation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub histogram_bins: usize,
    /// Time scale selected at startup for the live series.
    pub default_scale: Granularity,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            histogram_bins: 10,
            default_scale: Granularity::Day,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Enable CORS.
    pub cors: bool,
    /// Updates queued per client before it starts missing snapshots.
    pub client_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            cors: true,
            client_buffer: 16,
        }
    }
}

/// Per-token unit prices for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// Pricing table used for cost estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Fallback tier for models missing from `models`.
    pub default: ModelPrice,
    pub models: BTreeMap<String, ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let models = [
            ("gpt-4", 0.000_03, 0.000_06),
            ("gpt-3.5-turbo", 0.000_001_5, 0.000_002),
            ("claude-2", 0.000_01, 0.000_03),
        ]
        .into_iter()
        .map(|(name, input, output)| (name.to_string(), ModelPrice { input, output }))
        .collect();

        Self {
            default: ModelPrice {
                input: 0.000_005,
                output: 0.000_01,
            },
            models,
        }
    }
}
