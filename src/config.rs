//! Configuration for vault-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::amount::Amount;
use crate::error::{LedgerError, Result};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vault-ledger")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `ledger.db`
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    // ===== Vault parameters =====

    #[serde(default = "default_min_deposit")]
    pub min_deposit_amount: Amount,

    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal_amount: Amount,

    #[serde(default = "default_min_borrow")]
    pub min_borrow_amount: Amount,

    /// Reward APR in basis points (500 = 5%)
    #[serde(default = "default_reward_apr_bps")]
    pub reward_apr_bps: u32,

    /// Minimum collateral as basis points of the borrowed amount (15000 = 150%)
    #[serde(default = "default_collateral_ratio_bps")]
    pub collateral_ratio_bps: u32,

    /// Epoch length for automatic rollover (0 disables it)
    #[serde(default = "default_epoch_duration")]
    pub epoch_duration_secs: u64,

    // ===== Concurrency =====

    /// Bounded wait for user, epoch and connection locks
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    // ===== Event ingestion =====

    #[serde(default = "default_max_attempts")]
    pub max_event_attempts: u32,

    /// Base retry delay; doubles per attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// How long a claimed event stays invisible to other consumers
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
}

fn default_min_deposit() -> Amount {
    Amount::new(100_000_000)
}

fn default_min_withdrawal() -> Amount {
    Amount::new(100_000_000)
}

fn default_min_borrow() -> Amount {
    Amount::new(1_000_000_000)
}

fn default_reward_apr_bps() -> u32 {
    500
}

fn default_collateral_ratio_bps() -> u32 {
    15_000
}

fn default_epoch_duration() -> u64 {
    604_800
}

fn default_lock_timeout() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_retry_delay() -> u64 {
    300
}

fn default_visibility_timeout() -> u64 {
    60
}

fn default_claim_batch_size() -> u32 {
    50
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_consumer_count() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            min_deposit_amount: default_min_deposit(),
            min_withdrawal_amount: default_min_withdrawal(),
            min_borrow_amount: default_min_borrow(),
            reward_apr_bps: default_reward_apr_bps(),
            collateral_ratio_bps: default_collateral_ratio_bps(),
            epoch_duration_secs: default_epoch_duration(),
            lock_timeout_ms: default_lock_timeout(),
            max_event_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            visibility_timeout_secs: default_visibility_timeout(),
            claim_batch_size: default_claim_batch_size(),
            poll_interval_ms: default_poll_interval(),
            consumer_count: default_consumer_count(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LedgerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.collateral_ratio_bps == 0 {
            return Err(LedgerError::Config("collateral_ratio_bps must be positive".into()));
        }
        if self.max_event_attempts == 0 {
            return Err(LedgerError::Config("max_event_attempts must be at least 1".into()));
        }
        if self.claim_batch_size == 0 {
            return Err(LedgerError::Config("claim_batch_size must be at least 1".into()));
        }
        if self.max_retry_delay_secs < self.retry_delay_secs {
            return Err(LedgerError::Config(
                "max_retry_delay_secs must not be below retry_delay_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_vault_parameters() {
        let config = Config::default();
        assert_eq!(config.reward_apr_bps, 500);
        assert_eq!(config.collateral_ratio_bps, 15_000);
        assert_eq!(config.epoch_duration_secs, 604_800);
        assert_eq!(config.min_borrow_amount, Amount::new(1_000_000_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("reward_apr_bps = 750\nmin_deposit_amount = \"5\"\n").unwrap();
        assert_eq!(config.reward_apr_bps, 750);
        assert_eq!(config.min_deposit_amount, Amount::new(5));
        assert_eq!(config.max_event_attempts, 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.claim_batch_size = 7;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = Config {
            max_event_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }
}
