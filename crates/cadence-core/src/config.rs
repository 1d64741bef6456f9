//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub coalescer: CoalescerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
            .join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }

    fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.coalescer.validate()
    }
}

/// Polling worker and claim configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the worker polls the store for due actions.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// Maximum actions claimed per poll cycle.
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: usize,
    /// Actions due within this window are claimed early.
    #[serde(default = "default_lookahead")]
    pub claim_lookahead_seconds: f64,
    /// Claims older than this are treated as crash evidence and reset
    /// to pending on the next start.
    #[serde(default = "default_stale_threshold")]
    pub stale_claim_threshold_seconds: u64,
}

fn default_poll_interval() -> f64 { 30.0 }
fn default_claim_batch() -> usize { 10 }
fn default_lookahead() -> f64 { 60.0 }
fn default_stale_threshold() -> u64 { 900 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            claim_batch_size: default_claim_batch(),
            claim_lookahead_seconds: default_lookahead(),
            stale_claim_threshold_seconds: default_stale_threshold(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds <= 0.0 {
            return Err(crate::error::CadenceError::Config(
                "poll_interval_seconds must be positive".into(),
            ));
        }
        if self.claim_batch_size == 0 {
            return Err(crate::error::CadenceError::Config(
                "claim_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Message debounce/coalescing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Lower bound of the jittered quiet period before a buffer flushes.
    #[serde(default = "default_debounce_min")]
    pub debounce_min_seconds: f64,
    /// Upper bound of the jittered quiet period.
    #[serde(default = "default_debounce_max")]
    pub debounce_max_seconds: f64,
    /// Buffer size that forces an immediate flush.
    #[serde(default = "default_max_buffered")]
    pub max_buffered_messages: usize,
    /// Elapsed time since the first buffered message that forces a flush,
    /// even while messages keep re-arming the debounce timer.
    #[serde(default = "default_max_wait")]
    pub max_buffer_wait_seconds: f64,
}

fn default_debounce_min() -> f64 { 8.0 }
fn default_debounce_max() -> f64 { 20.0 }
fn default_max_buffered() -> usize { 10 }
fn default_max_wait() -> f64 { 90.0 }

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            debounce_min_seconds: default_debounce_min(),
            debounce_max_seconds: default_debounce_max(),
            max_buffered_messages: default_max_buffered(),
            max_buffer_wait_seconds: default_max_wait(),
        }
    }
}

impl CoalescerConfig {
    fn validate(&self) -> Result<()> {
        if self.debounce_min_seconds < 0.0 || self.debounce_max_seconds < self.debounce_min_seconds {
            return Err(crate::error::CadenceError::Config(
                "debounce range must satisfy 0 <= min <= max".into(),
            ));
        }
        if self.max_buffered_messages == 0 {
            return Err(crate::error::CadenceError::Config(
                "max_buffered_messages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Action store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding scheduled actions.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.cadence/actions.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

impl StoreConfig {
    /// Resolve `db_path`, expanding a leading `~` to the home directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        } else {
            PathBuf::from(&self.db_path)
        }
    }
}
