//! Configuration management

use anyhow::{Context, Result};
use scalefeed_broadcaster::{
    HubConfig, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_QUEUED, DEFAULT_RETRY_HINT, DEFAULT_WRITE_TIMEOUT,
};
use scalefeed_ingest::{
    GateConfig, LinkConfig, DEFAULT_BAUD_RATE, DEFAULT_MIN_PERSIST_INTERVAL,
    DEFAULT_PRICE_THRESHOLD, DEFAULT_REOPEN_DELAY, DEFAULT_VOLUME_THRESHOLD,
    DEFAULT_WEIGHT_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Label stored with records created by the ingestion path
pub const DEFAULT_SOURCE_LABEL: &str = "Scale Device";

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    /// Device path, e.g. "/dev/ttyUSB0". Absent or empty disables ingestion.
    pub path: Option<String>,

    pub baud_rate: u32,

    /// Administrative switch for the ingestion link
    pub enabled: bool,

    pub reopen_delay_ms: u64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            enabled: true,
            reopen_delay_ms: DEFAULT_REOPEN_DELAY.as_millis() as u64,
        }
    }
}

/// Persistence throttling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistSection {
    /// Minimum time between two persists of an unchanged reading
    pub min_interval_ms: u64,

    pub weight_threshold: f64,
    pub volume_threshold: f64,
    pub price_threshold: f64,

    /// Stored as the record source for ingested readings
    pub source_label: Option<String>,
}

impl Default for PersistSection {
    fn default() -> Self {
        Self {
            min_interval_ms: DEFAULT_MIN_PERSIST_INTERVAL.as_millis() as u64,
            weight_threshold: DEFAULT_WEIGHT_THRESHOLD,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            price_threshold: DEFAULT_PRICE_THRESHOLD,
            source_label: Some(DEFAULT_SOURCE_LABEL.to_string()),
        }
    }
}

/// Live feed socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSection {
    /// Defaults to the platform socket directory
    pub socket_path: Option<String>,

    pub keep_alive_secs: u64,

    /// Reconnect hint sent to subscribers
    pub retry_ms: u64,

    /// Undelivered payloads after which a subscriber is dropped
    pub max_queued: usize,

    pub write_timeout_ms: u64,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            socket_path: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE.as_secs(),
            retry_ms: DEFAULT_RETRY_HINT.as_millis() as u64,
            max_queued: DEFAULT_MAX_QUEUED,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// SQLite database location (defaults to the platform data directory)
    pub database_path: Option<String>,

    /// Control socket location (defaults to the platform socket directory)
    pub ipc_socket_path: Option<String>,

    pub link: LinkSection,
    pub persist: PersistSection,
    pub live: LiveSection,
}

impl DaemonConfig {
    /// Load configuration from `path` (or the default location), creating a
    /// default file when none exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => scalefeed_paths::expand_home(path)?,
            None => scalefeed_paths::get_config_path()
                .context("Failed to resolve config path")?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

            let mut config: DaemonConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;

            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Apply `SCALEFEED_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Values that fail to parse are
    /// ignored and the configured value is kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SCALEFEED_SERIAL_PATH") {
            self.link.path = Some(path);
        }
        if let Some(enabled) = lookup("SCALEFEED_INGEST_ENABLED") {
            self.link.enabled = !enabled.trim().eq_ignore_ascii_case("false");
        }
        if let Some(label) = lookup("SCALEFEED_SOURCE_LABEL") {
            self.persist.source_label = Some(label);
        }

        override_parsed(&lookup, "SCALEFEED_BAUD_RATE", &mut self.link.baud_rate);
        override_parsed(&lookup, "SCALEFEED_REOPEN_DELAY_MS", &mut self.link.reopen_delay_ms);
        override_parsed(&lookup, "SCALEFEED_MIN_PERSIST_MS", &mut self.persist.min_interval_ms);
        override_parsed(&lookup, "SCALEFEED_WEIGHT_DIFF", &mut self.persist.weight_threshold);
        override_parsed(&lookup, "SCALEFEED_VOLUME_DIFF", &mut self.persist.volume_threshold);
        override_parsed(&lookup, "SCALEFEED_PRICE_DIFF", &mut self.persist.price_threshold);
    }

    pub fn link_config(&self) -> LinkConfig {
        let path = self
            .link
            .path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string);

        LinkConfig {
            path,
            baud_rate: if self.link.baud_rate == 0 {
                DEFAULT_BAUD_RATE
            } else {
                self.link.baud_rate
            },
            enabled: self.link.enabled,
            reopen_delay: non_zero_millis(self.link.reopen_delay_ms, DEFAULT_REOPEN_DELAY),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            weight_threshold: self.persist.weight_threshold,
            volume_threshold: self.persist.volume_threshold,
            price_threshold: self.persist.price_threshold,
            min_persist_interval: non_zero_millis(
                self.persist.min_interval_ms,
                DEFAULT_MIN_PERSIST_INTERVAL,
            ),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            keep_alive_interval: if self.live.keep_alive_secs == 0 {
                DEFAULT_KEEP_ALIVE
            } else {
                Duration::from_secs(self.live.keep_alive_secs)
            },
            retry_hint: non_zero_millis(self.live.retry_ms, DEFAULT_RETRY_HINT),
            max_queued: if self.live.max_queued == 0 {
                DEFAULT_MAX_QUEUED
            } else {
                self.live.max_queued
            },
            write_timeout: non_zero_millis(self.live.write_timeout_ms, DEFAULT_WRITE_TIMEOUT),
        }
    }

    /// Label stored with ingested records; empty disables it
    pub fn source_label(&self) -> Option<&str> {
        self.persist
            .source_label
            .as_deref()
            .filter(|label| !label.trim().is_empty())
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        resolve(self.database_path.as_deref(), scalefeed_paths::get_database_path)
    }

    pub fn live_socket_path(&self) -> Result<PathBuf> {
        resolve(self.live.socket_path.as_deref(), scalefeed_paths::get_live_socket_path)
    }

    pub fn ipc_socket_path(&self) -> Result<PathBuf> {
        resolve(self.ipc_socket_path.as_deref(), scalefeed_paths::get_ipc_socket_path)
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!("Ignoring invalid {}={:?}", key, raw),
    }
}

fn non_zero_millis(millis: u64, default: Duration) -> Duration {
    if millis == 0 {
        default
    } else {
        Duration::from_millis(millis)
    }
}

fn resolve(configured: Option<&str>, default: fn() -> Result<PathBuf>) -> Result<PathBuf> {
    match configured.filter(|path| !path.trim().is_empty()) {
        Some(path) => scalefeed_paths::expand_home(Path::new(path)),
        None => default(),
    }
}
