//! UTXO selection
//!
//! Picks the inputs of a new proposal. Preference order, per confirmation
//! tier (confirmed outputs first, then all outputs):
//! 1. one input close to the amount
//! 2. accumulation of smaller inputs, skipping inputs that cannot pay for
//!    their own bytes
//! 3. the smallest single input large enough to cover amount and fee
//!
//! The fee depends on the number of inputs and on whether a change output
//! exists, so both are settled together; change below dust is folded into
//! the fee.

use crate::chain::{ChainAdapter, CoinCapabilities};
use crate::core::config::SelectionConfig;
use crate::core::{Result, TxpError, Utxo};
use rand::seq::SliceRandom;
use std::collections::HashSet;

/// How the fee is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    /// Rate in satoshis per kB, fee follows the transaction size
    PerKb(u64),
    /// Absolute fee regardless of size
    Fixed(u64),
}

/// What to select for
#[derive(Debug, Clone)]
pub struct SelectionParams {
    /// Requested output amounts; ignored for the total when `send_max`
    pub outputs: Vec<u64>,
    pub fee: FeeMode,
    /// Wallet quorum, drives the per-input size
    pub m: u8,
    pub n: u8,
    pub exclude_unconfirmed: bool,
    /// Outpoints (`txid:vout`) the caller does not want spent
    pub utxos_to_exclude: HashSet<String>,
    /// Spend every worthwhile input into a single output
    pub send_max: bool,
}

impl SelectionParams {
    pub fn new(outputs: Vec<u64>, fee: FeeMode, m: u8, n: u8) -> Self {
        Self {
            outputs,
            fee,
            m,
            n,
            exclude_unconfirmed: false,
            utxos_to_exclude: HashSet::new(),
            send_max: false,
        }
    }

    /// Total of the requested outputs, saturating; see `checked_amount`
    pub fn amount(&self) -> u64 {
        self.checked_amount().unwrap_or(u64::MAX)
    }

    /// Total of the requested outputs, `None` on overflow
    pub fn checked_amount(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |sum, amount| sum.checked_add(*amount))
    }
}

/// A settled selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Chosen inputs, in random order
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    /// Change amount; zero when there is no change output
    pub change: u64,
    /// Total sent to the requested outputs (for send-max, what is left after
    /// the fee)
    pub amount: u64,
    /// Estimated signed size in bytes
    pub size: usize,
}

impl Selection {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.satoshis).sum()
    }

    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

/// Outcome of an accumulation attempt
enum Accumulated {
    Found(Selection),
    /// Ran past the size ceiling before covering the amount
    TooLarge,
    /// Not enough, or fees grew past the configured bounds
    NotFound,
}

/// Input selector for one coin and configuration
pub struct UtxoSelector<'a> {
    adapter: &'a dyn ChainAdapter,
    config: &'a SelectionConfig,
}

impl<'a> UtxoSelector<'a> {
    pub fn new(adapter: &'a dyn ChainAdapter, config: &'a SelectionConfig) -> Self {
        Self { adapter, config }
    }

    fn caps(&self) -> &CoinCapabilities {
        self.adapter.capabilities()
    }

    /// Select inputs for `params` out of `utxos`.
    ///
    /// # Errors
    /// - `DustAmount` if a requested output is below dust
    /// - `InsufficientFunds` if the usable outputs do not reach the amount
    /// - `InsufficientFundsForFee` if they reach it but cannot pay the fee
    /// - `TxMaxSizeExceeded` if only oversized combinations would work
    /// - `InvalidParams` if the output amounts overflow
    pub fn select(&self, utxos: &[Utxo], params: &SelectionParams) -> Result<Selection> {
        if params.checked_amount().is_none() {
            return Err(TxpError::InvalidParams(
                "total output amount overflows".to_string(),
            ));
        }
        let candidates = self.usable(utxos, params);

        let mut selection = if params.send_max {
            self.select_max(candidates, params)?
        } else {
            self.select_amount(candidates, params)?
        };

        selection.inputs.shuffle(&mut rand::thread_rng());
        log::debug!(
            "Selected {} inputs: amount {}, fee {}, change {}, {} bytes",
            selection.inputs.len(),
            selection.amount,
            selection.fee,
            selection.change,
            selection.size
        );
        Ok(selection)
    }

    /// Drop dust, excluded and (if requested) unconfirmed outputs
    fn usable(&self, utxos: &[Utxo], params: &SelectionParams) -> Vec<Utxo> {
        let dust = self.caps().dust_threshold;
        utxos
            .iter()
            .filter(|u| u.satoshis >= dust && u.satoshis > 0)
            .filter(|u| !params.utxos_to_exclude.contains(&u.outpoint()))
            .filter(|u| !params.exclude_unconfirmed || u.is_confirmed())
            .cloned()
            .collect()
    }

    fn fee_for(&self, params: &SelectionParams, n_inputs: usize, with_change: bool) -> u64 {
        match params.fee {
            FeeMode::PerKb(rate) => self.adapter.fee_for(
                rate,
                n_inputs,
                params.outputs.len() + with_change as usize,
                params.m,
                params.n,
            ),
            FeeMode::Fixed(fee) => fee,
        }
    }

    /// Fee added by one more input
    fn fee_per_input(&self, params: &SelectionParams) -> u64 {
        self.fee_for(params, 2, true)
            .saturating_sub(self.fee_for(params, 1, true))
    }

    fn size_for(&self, params: &SelectionParams, n_inputs: usize, with_change: bool) -> usize {
        self.adapter.estimate_size(
            n_inputs,
            params.outputs.len() + with_change as usize,
            params.m,
            params.n,
        )
    }

    // =========================================================================
    // Fee settlement
    // =========================================================================

    /// Settle fee and change for a fixed input set. Returns `None` if the
    /// inputs cannot cover amount plus fee.
    fn settle(&self, inputs: Vec<Utxo>, params: &SelectionParams) -> Option<Selection> {
        let amount = params.amount();
        let total: u64 = inputs.iter().map(|u| u.satoshis).sum();
        let dust = self.caps().dust_threshold;
        let mut with_change = self.caps().supports_change;

        for _ in 0..self.config.max_fee_iterations {
            let fee = self.fee_for(params, inputs.len(), with_change);
            let needed = amount.checked_add(fee)?;

            if total < needed {
                if with_change {
                    with_change = false;
                    continue;
                }
                return None;
            }

            let residual = total - needed;
            if with_change && residual < dust.max(1) {
                with_change = false;
                continue;
            }

            let (fee, change) = if with_change {
                (fee, residual)
            } else {
                // no change output: whatever is left goes to the miners
                (fee + residual, 0)
            };
            let size = self.size_for(params, inputs.len(), with_change);
            return Some(Selection {
                inputs,
                fee,
                change,
                amount,
                size,
            });
        }
        None
    }

    // =========================================================================
    // Amount selection
    // =========================================================================

    fn select_amount(&self, candidates: Vec<Utxo>, params: &SelectionParams) -> Result<Selection> {
        let amount = params.amount();
        let dust = self.caps().dust_threshold;
        if params.outputs.is_empty() || params.outputs.iter().any(|&a| a == 0 || a < dust) {
            return Err(TxpError::DustAmount);
        }

        let total: u64 = candidates.iter().map(|u| u.satoshis).sum();
        if total < amount {
            return Err(TxpError::InsufficientFunds);
        }

        // Even every worthwhile input together cannot pay the fee
        let fee_per_input = self.fee_per_input(params);
        let worthwhile: Vec<&Utxo> = candidates
            .iter()
            .filter(|u| u.satoshis > fee_per_input)
            .collect();
        let worthwhile_total: u64 = worthwhile.iter().map(|u| u.satoshis).sum();
        let min_fee = self.fee_for(params, worthwhile.len(), false);
        if worthwhile_total < amount.saturating_add(min_fee) {
            return Err(TxpError::InsufficientFundsForFee);
        }

        let confirmed: Vec<Utxo> = candidates
            .iter()
            .filter(|u| u.is_confirmed())
            .cloned()
            .collect();
        let mut tiers = vec![confirmed];
        if tiers[0].len() < candidates.len() {
            tiers.push(candidates);
        }

        let mut too_large = false;
        for (tier, utxos) in tiers.into_iter().enumerate() {
            log::trace!("Selection tier {} over {} outputs", tier, utxos.len());
            match self.select_from_tier(utxos, params) {
                Accumulated::Found(selection) => return Ok(selection),
                Accumulated::TooLarge => too_large = true,
                Accumulated::NotFound => {}
            }
        }

        if too_large {
            Err(TxpError::TxMaxSizeExceeded)
        } else {
            Err(TxpError::InsufficientFundsForFee)
        }
    }

    fn select_from_tier(&self, mut utxos: Vec<Utxo>, params: &SelectionParams) -> Accumulated {
        let amount = params.amount();
        let max_size = self.caps().max_tx_size;
        let single_fee = self.fee_for(params, 1, true);
        let single_limit =
            (amount as f64 * self.config.max_single_utxo_factor) as u64 + single_fee;

        utxos.sort_by_key(|u| u.satoshis);

        // 1. A single input within the preferred window
        if let Some(utxo) = utxos
            .iter()
            .find(|u| u.satoshis >= amount + single_fee && u.satoshis <= single_limit)
        {
            if let Some(selection) = self.settle(vec![utxo.clone()], params) {
                return Accumulated::Found(selection);
            }
        }

        // 2. Accumulate smaller inputs
        let (big, small): (Vec<Utxo>, Vec<Utxo>) =
            utxos.into_iter().partition(|u| u.satoshis > single_limit);
        let fee_per_input = self.fee_per_input(params);
        let min_contribution = amount as f64 * self.config.min_tx_amount_vs_utxo_factor;
        let small: Vec<Utxo> = small
            .into_iter()
            .filter(|u| u.satoshis > fee_per_input)
            .filter(|u| big.is_empty() || (u.satoshis - fee_per_input) as f64 >= min_contribution)
            .collect();

        let mut too_large = false;
        match self.accumulate(small.iter(), !big.is_empty(), params) {
            Accumulated::Found(selection) => return Accumulated::Found(selection),
            Accumulated::TooLarge => {
                too_large = true;
                // fewer, larger inputs may still fit
                if let Accumulated::Found(selection) =
                    self.accumulate(small.iter().rev(), !big.is_empty(), params)
                {
                    return Accumulated::Found(selection);
                }
            }
            Accumulated::NotFound => {}
        }

        // 3. Smallest big input covering amount and fee
        for utxo in &big {
            if utxo.satoshis < amount + single_fee {
                continue;
            }
            if let Some(selection) = self.settle(vec![utxo.clone()], params) {
                if selection.size <= max_size {
                    return Accumulated::Found(selection);
                }
            }
        }

        if too_large {
            Accumulated::TooLarge
        } else {
            Accumulated::NotFound
        }
    }

    fn accumulate<'u>(
        &self,
        utxos: impl Iterator<Item = &'u Utxo>,
        has_big_fallback: bool,
        params: &SelectionParams,
    ) -> Accumulated {
        let amount = params.amount();
        let max_size = self.caps().max_tx_size;
        let single_fee = self.fee_for(params, 1, true).max(1);

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total: u64 = 0;

        for utxo in utxos {
            selected.push(utxo.clone());
            total += utxo.satoshis;

            if self.size_for(params, selected.len(), true) > max_size {
                return Accumulated::TooLarge;
            }

            let fee = self.fee_for(params, selected.len(), true);
            if has_big_fallback
                && fee as f64 > amount as f64 * self.config.max_fee_vs_tx_amount_factor
                && fee as f64 > single_fee as f64 * self.config.max_fee_vs_single_utxo_fee_factor
            {
                log::trace!("Accumulated fee {} too high, trying a single big input", fee);
                return Accumulated::NotFound;
            }

            if total >= amount + fee {
                if let Some(selection) = self.settle(selected.clone(), params) {
                    return Accumulated::Found(selection);
                }
            }
        }
        Accumulated::NotFound
    }

    // =========================================================================
    // Send max
    // =========================================================================

    fn select_max(&self, mut candidates: Vec<Utxo>, params: &SelectionParams) -> Result<Selection> {
        if candidates.is_empty() {
            return Err(TxpError::InsufficientFunds);
        }

        let fee_per_input = self.fee_per_input(params);
        candidates.retain(|u| u.satoshis > fee_per_input);
        if candidates.is_empty() {
            return Err(TxpError::InsufficientFundsForFee);
        }

        // keep the largest inputs that fit the size ceiling
        candidates.sort_by(|a, b| b.satoshis.cmp(&a.satoshis));
        let max_size = self.caps().max_tx_size;
        while candidates.len() > 1 && self.size_for(params, candidates.len(), false) > max_size {
            candidates.pop();
        }

        let total: u64 = candidates.iter().map(|u| u.satoshis).sum();
        let fee = self.fee_for(params, candidates.len(), false);
        let amount = total.saturating_sub(fee);
        if amount == 0 || amount < self.caps().dust_threshold {
            return Err(TxpError::InsufficientFundsForFee);
        }

        let size = self.size_for(params, candidates.len(), false);
        Ok(Selection {
            inputs: candidates,
            fee,
            change: 0,
            amount,
            size,
        })
    }
}
