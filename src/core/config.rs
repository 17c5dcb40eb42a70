//! Engine configuration
//!
//! All knobs have production defaults. A JSON file may override any subset
//! of them; missing fields keep their defaults.

use crate::core::error::{Result, TxpError};
use crate::core::fee::FeeLevel;
use crate::core::Coin;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// A single UTXO up to this multiple of the amount is preferred over fan-in
pub const DEFAULT_MAX_SINGLE_UTXO_FACTOR: f64 = 2.0;

/// Small inputs worth less than this fraction of the amount are not
/// accumulated while a big input could cover the amount alone
pub const DEFAULT_MIN_TX_AMOUNT_VS_UTXO_FACTOR: f64 = 0.1;

/// Fee-to-amount ratio above which accumulation gives way to a big input
pub const DEFAULT_MAX_FEE_VS_TX_AMOUNT_FACTOR: f64 = 0.05;

/// Accumulated fee relative to a single-input fee above which accumulation
/// gives way to a big input
pub const DEFAULT_MAX_FEE_VS_SINGLE_UTXO_FEE_FACTOR: f64 = 5.0;

pub const DEFAULT_MAX_FEE_ITERATIONS: usize = 8;

/// Consecutive rejections tolerated before creation is throttled
pub const DEFAULT_BACKOFF_OFFSET: u32 = 10;
pub const DEFAULT_BACKOFF_COOLDOWN_SECS: u64 = 600;

pub const DEFAULT_LOCK_WAIT_SECS: u64 = 5;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 40;
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 50;

/// Removal lock after a copayer other than the creator acted
pub const DEFAULT_DELETE_LOCK_SECS: u64 = 600;

/// Extra confirmation targets tried when a level has no estimate
pub const DEFAULT_FEE_FALLBACK_SPAN: u32 = 2;

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    pub max_single_utxo_factor: f64,
    pub min_tx_amount_vs_utxo_factor: f64,
    pub max_fee_vs_tx_amount_factor: f64,
    pub max_fee_vs_single_utxo_fee_factor: f64,
    pub max_fee_iterations: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_single_utxo_factor: DEFAULT_MAX_SINGLE_UTXO_FACTOR,
            min_tx_amount_vs_utxo_factor: DEFAULT_MIN_TX_AMOUNT_VS_UTXO_FACTOR,
            max_fee_vs_tx_amount_factor: DEFAULT_MAX_FEE_VS_TX_AMOUNT_FACTOR,
            max_fee_vs_single_utxo_fee_factor: DEFAULT_MAX_FEE_VS_SINGLE_UTXO_FEE_FACTOR,
            max_fee_iterations: DEFAULT_MAX_FEE_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub offset: u32,
    pub cooldown_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            offset: DEFAULT_BACKOFF_OFFSET,
            cooldown_secs: DEFAULT_BACKOFF_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Longest time a caller waits for a wallet lease
    pub wait_secs: u64,
    /// Lease lifetime; an expired lease is reclaimed by the next caller
    pub ttl_secs: u64,
    pub retry_interval_ms: u64,
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// How often a holder pushes its lease expiry forward
    pub fn renew_interval(&self) -> Duration {
        self.ttl() / 3
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: DEFAULT_LOCK_WAIT_SECS,
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeeConfig {
    pub btc: Vec<FeeLevel>,
    pub bch: Vec<FeeLevel>,
    pub eth: Vec<FeeLevel>,
    pub fallback_span: u32,
}

impl FeeConfig {
    pub fn levels(&self, coin: Coin) -> &[FeeLevel] {
        match coin {
            Coin::Btc => &self.btc,
            Coin::Bch => &self.bch,
            Coin::Eth => &self.eth,
        }
    }

    pub fn level(&self, coin: Coin, name: &str) -> Option<&FeeLevel> {
        self.levels(coin).iter().find(|l| l.name == name)
    }

    /// Static fee rate used when nothing else is known: the `normal` level
    /// default, or the first level's default
    pub fn default_fee_per_kb(&self, coin: Coin) -> u64 {
        self.level(coin, "normal")
            .or_else(|| self.levels(coin).first())
            .map(|l| l.default_fee_per_kb)
            .unwrap_or(0)
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            btc: vec![
                FeeLevel::new("urgent", 2, 1.5, 75_000),
                FeeLevel::new("priority", 2, 1.0, 50_000),
                FeeLevel::new("normal", 3, 1.0, 30_000),
                FeeLevel::new("economy", 6, 1.0, 25_000),
                FeeLevel::new("superEconomy", 24, 1.0, 10_000),
            ],
            bch: vec![FeeLevel::new("normal", 2, 1.0, 2_000)],
            eth: vec![
                FeeLevel::new("urgent", 1, 1.0, 10_000_000_000),
                FeeLevel::new("priority", 2, 1.0, 5_000_000_000),
                FeeLevel::new("normal", 3, 1.0, 1_000_000_000),
                FeeLevel::new("economy", 4, 1.0, 1_000_000_000),
            ],
            fallback_span: DEFAULT_FEE_FALLBACK_SPAN,
        }
    }
}

// =============================================================================
// Engine Config
// =============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub selection: SelectionConfig,
    pub backoff: BackoffConfig,
    pub lock: LockConfig,
    pub fees: FeeConfig,
    pub delete_lock_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            selection: SelectionConfig::default(),
            backoff: BackoffConfig::default(),
            lock: LockConfig::default(),
            fees: FeeConfig::default(),
            delete_lock_secs: DEFAULT_DELETE_LOCK_SECS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            TxpError::InvalidParams(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&data)
            .map_err(|e| TxpError::InvalidParams(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        let s = &self.selection;
        let factors = [
            ("max_single_utxo_factor", s.max_single_utxo_factor),
            ("min_tx_amount_vs_utxo_factor", s.min_tx_amount_vs_utxo_factor),
            ("max_fee_vs_tx_amount_factor", s.max_fee_vs_tx_amount_factor),
            (
                "max_fee_vs_single_utxo_fee_factor",
                s.max_fee_vs_single_utxo_fee_factor,
            ),
        ];
        for (name, value) in factors {
            if !(value > 0.0) {
                return Err(TxpError::InvalidParams(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        if s.max_fee_iterations == 0 {
            return Err(TxpError::InvalidParams(
                "max_fee_iterations must be at least 1".to_string(),
            ));
        }
        if self.lock.ttl_secs == 0 {
            return Err(TxpError::InvalidParams(
                "lock ttl must be positive".to_string(),
            ));
        }
        for coin in [Coin::Btc, Coin::Bch, Coin::Eth] {
            let levels = self.fees.levels(coin);
            if levels.is_empty() {
                return Err(TxpError::InvalidParams(format!(
                    "no fee levels for {}",
                    coin
                )));
            }
            if levels.windows(2).any(|w| w[0].nb_blocks > w[1].nb_blocks) {
                return Err(TxpError::InvalidParams(format!(
                    "fee levels for {} must be ordered by confirmation target",
                    coin
                )));
            }
        }
        Ok(())
    }

    pub fn backoff_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.backoff.cooldown_secs as i64)
    }

    pub fn delete_lock(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delete_lock_secs as i64)
    }
}
