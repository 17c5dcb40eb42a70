//! Fee Estimation
//!
//! Named fee levels resolved against provider estimates:
//! - Each level targets a confirmation horizon (in blocks)
//! - Missing estimates fall back to slower horizons, then to a static default
//! - Resolved rates never increase as the horizon gets longer

use crate::core::config::FeeConfig;
use crate::core::error::{Result, TxpError};
use crate::core::{Coin, Network};
use crate::provider::BlockchainProvider;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in satoshis (or the coin's base unit) per kilobyte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn from_sat_per_kb(rate: u64) -> Self {
        Self(rate)
    }

    /// Calculate fee for a given size, rounded up to the next unit
    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        (self.0 * size_bytes as u64 + 999) / 1000
    }

    pub fn as_sat_per_kb(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Fee Levels
// =============================================================================

/// A named fee level such as `normal` or `economy`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeLevel {
    pub name: String,
    /// Confirmation target in blocks
    pub nb_blocks: u32,
    /// Applied to provider estimates, not to the static default
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    pub default_fee_per_kb: u64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl FeeLevel {
    pub fn new(name: &str, nb_blocks: u32, multiplier: f64, default_fee_per_kb: u64) -> Self {
        Self {
            name: name.to_string(),
            nb_blocks,
            multiplier,
            default_fee_per_kb,
        }
    }
}

/// A fee level resolved to a concrete rate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeLevelEstimate {
    pub level: String,
    pub fee_per_kb: u64,
    pub nb_blocks: u32,
    /// The static default was used because no estimate was available
    pub no_estimate: bool,
}

/// Confirmation targets to ask the provider for
pub fn sample_targets(levels: &[FeeLevel], fallback_span: u32) -> Vec<u32> {
    let mut targets = BTreeSet::new();
    for level in levels {
        for target in level.nb_blocks..=level.nb_blocks + fallback_span {
            targets.insert(target);
        }
    }
    targets.into_iter().collect()
}

/// Resolve every level against the sampled estimates.
///
/// A level without an estimate at its own target uses the closest slower
/// target within `fallback_span`, else its static default. Levels are then
/// clamped so a slower level never costs more than a faster one.
pub fn resolve_fee_levels(
    levels: &[FeeLevel],
    samples: &HashMap<u32, Option<u64>>,
    fallback_span: u32,
) -> Vec<FeeLevelEstimate> {
    let mut resolved: Vec<FeeLevelEstimate> = levels
        .iter()
        .map(|level| {
            let estimate = (level.nb_blocks..=level.nb_blocks + fallback_span)
                .find_map(|target| samples.get(&target).copied().flatten());

            match estimate {
                Some(fee) => FeeLevelEstimate {
                    level: level.name.clone(),
                    fee_per_kb: (fee as f64 * level.multiplier).round() as u64,
                    nb_blocks: level.nb_blocks,
                    no_estimate: false,
                },
                None => FeeLevelEstimate {
                    level: level.name.clone(),
                    fee_per_kb: level.default_fee_per_kb,
                    nb_blocks: level.nb_blocks,
                    no_estimate: true,
                },
            }
        })
        .collect();

    let mut ceiling = u64::MAX;
    for estimate in resolved.iter_mut() {
        estimate.fee_per_kb = estimate.fee_per_kb.min(ceiling);
        ceiling = estimate.fee_per_kb;
    }
    resolved
}

/// Levels at their static defaults
pub fn default_fee_levels(levels: &[FeeLevel]) -> Vec<FeeLevelEstimate> {
    resolve_fee_levels(levels, &HashMap::new(), 0)
}

/// Fetch estimates and resolve the fee level table for a coin.
///
/// Provider failure degrades to static defaults instead of failing.
pub async fn fetch_fee_levels(
    provider: &dyn BlockchainProvider,
    coin: Coin,
    network: Network,
    config: &FeeConfig,
) -> Vec<FeeLevelEstimate> {
    let levels = config.levels(coin);
    let targets = sample_targets(levels, config.fallback_span);

    match provider.estimate_fee(coin, network, &targets).await {
        Ok(samples) => resolve_fee_levels(levels, &samples, config.fallback_span),
        Err(e) => {
            log::warn!(
                "Fee estimation unavailable for {}/{}: {}; using defaults",
                coin,
                network,
                e
            );
            default_fee_levels(levels)
        }
    }
}

/// Resolve a single named level to a fee rate
pub async fn resolve_fee_per_kb(
    provider: &dyn BlockchainProvider,
    coin: Coin,
    network: Network,
    config: &FeeConfig,
    level_name: &str,
) -> Result<u64> {
    if config.level(coin, level_name).is_none() {
        return Err(TxpError::InvalidFeeLevel(level_name.to_string()));
    }

    let levels = fetch_fee_levels(provider, coin, network, config).await;
    levels
        .into_iter()
        .find(|l| l.level == level_name)
        .map(|l| l.fee_per_kb)
        .ok_or_else(|| TxpError::InvalidFeeLevel(level_name.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
