//! Runtime configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! config apart from the seal key. Durations are whole seconds.

use crate::seal::{SealError, SeedVault};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when the config has no seal key
pub const SEAL_KEY_ENV: &str = "DRAWKEEPER_SEAL_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("seal key: {0}")]
    SealKey(#[from] SealError),
}

/// Phase offsets and poller cadences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Commit this long before `scheduled_at`
    pub commit_lead_secs: u64,
    /// Close sales this long before `scheduled_at`
    pub close_sales_lead_secs: u64,
    /// Finalize data this long before `scheduled_at`
    pub finalize_lead_secs: u64,
    pub commit_interval_secs: u64,
    pub close_sales_interval_secs: u64,
    pub finalize_interval_secs: u64,
    pub execute_interval_secs: u64,
    pub payout_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            commit_lead_secs: 24 * 3600,
            close_sales_lead_secs: 5 * 60,
            finalize_lead_secs: 60,
            commit_interval_secs: 3600,
            close_sales_interval_secs: 60,
            finalize_interval_secs: 60,
            execute_interval_secs: 60,
            payout_interval_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}

impl ScheduleConfig {
    pub fn commit_lead(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.commit_lead_secs as i64)
    }

    pub fn close_sales_lead(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.close_sales_lead_secs as i64)
    }

    pub fn finalize_lead(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.finalize_lead_secs as i64)
    }
}

/// Payout queue limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Concurrent transfers within one drain
    pub workers: usize,
    /// Largest single transfer; bigger payouts are chunked
    pub max_per_transaction: u64,
    pub inter_transaction_delay_ms: u64,
    pub send_timeout_secs: u64,
    /// `Processing` rows older than this are swept back
    pub stale_processing_secs: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            workers: 4,
            max_per_transaction: 1_000_000_000_000,
            inter_transaction_delay_ms: 1_000,
            send_timeout_secs: 60,
            stale_processing_secs: 900,
        }
    }
}

impl PayoutConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn inter_transaction_delay(&self) -> Duration {
        Duration::from_millis(self.inter_transaction_delay_ms)
    }

    pub fn stale_processing_after(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.stale_processing_secs as i64)
    }
}

/// Draw execution limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parallel ticket settlement workers
    pub settle_workers: usize,
    /// Claimed executions older than this are failed by the sweep
    pub stale_execution_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_workers: 4,
            stale_execution_secs: 1800,
        }
    }
}

impl EngineConfig {
    pub fn stale_execution_after(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.stale_execution_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep everything in memory (nothing survives a restart)
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,
    pub payout: PayoutConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    /// Hex AES-256 key. Prefer the environment variable in production.
    pub seal_key: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.payout;
        if p.max_attempts == 0 {
            return Err(ConfigError::Invalid("payout.max_attempts must be > 0".into()));
        }
        if p.batch_size == 0 {
            return Err(ConfigError::Invalid("payout.batch_size must be > 0".into()));
        }
        if p.workers == 0 {
            return Err(ConfigError::Invalid("payout.workers must be > 0".into()));
        }
        if p.max_per_transaction == 0 {
            return Err(ConfigError::Invalid("payout.max_per_transaction must be > 0".into()));
        }
        // A live worker refreshes its heartbeat at least this often
        let heartbeat_gap_ms = p
            .send_timeout_secs
            .saturating_mul(1_000)
            .saturating_add(p.inter_transaction_delay_ms);
        if p.stale_processing_secs.saturating_mul(1_000) <= heartbeat_gap_ms {
            return Err(ConfigError::Invalid(
                "payout.stale_processing_secs must exceed send_timeout_secs + inter_transaction_delay_ms".into(),
            ));
        }
        if self.engine.settle_workers == 0 {
            return Err(ConfigError::Invalid("engine.settle_workers must be > 0".into()));
        }

        let s = &self.schedule;
        if s.close_sales_lead_secs < s.finalize_lead_secs {
            return Err(ConfigError::Invalid(
                "schedule.close_sales_lead_secs must be >= finalize_lead_secs".into(),
            ));
        }
        if s.commit_lead_secs < s.close_sales_lead_secs {
            return Err(ConfigError::Invalid(
                "schedule.commit_lead_secs must be >= close_sales_lead_secs".into(),
            ));
        }
        let intervals = [
            s.commit_interval_secs,
            s.close_sales_interval_secs,
            s.finalize_interval_secs,
            s.execute_interval_secs,
            s.payout_interval_secs,
            s.sweep_interval_secs,
        ];
        if intervals.contains(&0) {
            return Err(ConfigError::Invalid("schedule intervals must be > 0".into()));
        }
        Ok(())
    }

    /// Seal key from the config, else from the environment
    pub fn seed_vault(&self) -> Result<SeedVault, ConfigError> {
        let key = match &self.seal_key {
            Some(key) => key.clone(),
            None => std::env::var(SEAL_KEY_ENV)
                .map_err(|_| ConfigError::Invalid(format!("no seal_key and {} unset", SEAL_KEY_ENV)))?,
        };
        Ok(SeedVault::from_hex(&key)?)
    }
}
