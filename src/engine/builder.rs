//! Proposal construction and publishing
//!
//! Creation validates the request, selects funds under the wallet lease and
//! stores the proposal as `temporary`. Nothing is reserved until the creator
//! publishes it: publishing re-checks the inputs under the lease, so two
//! temporary proposals may overlap but two published ones never do.

use super::{CopayerContext, ProposalEngine, ProposalEvent};
use crate::chain::{ChainAdapter, CoinFamily};
use crate::core::fee::resolve_fee_per_kb;
use crate::core::utxo::total_satoshis;
use crate::core::{
    ProposalInput, ProposalOutput, ProposalStatus, Result, TransactionProposal, TxpError, Utxo,
    WalletPolicy,
};
use crate::crypto::verify_hex_signature;
use crate::selection::{FeeMode, SelectionParams, UtxoSelector};
use crate::storage::StatusPatch;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Fee level used when the request names neither a level nor a rate
pub const DEFAULT_FEE_LEVEL: &str = "normal";

/// Options of a proposal creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTxOpts {
    pub outputs: Vec<ProposalOutput>,
    pub fee_level: Option<String>,
    pub fee_per_kb: Option<u64>,
    /// Absolute fee; excludes `fee_level` and `fee_per_kb`
    pub fee: Option<u64>,
    /// Client-supplied id making creation idempotent
    pub tx_proposal_id: Option<String>,
    pub send_max: bool,
    pub exclude_unconfirmed_utxos: bool,
    pub no_shuffle_outputs: bool,
    pub message: Option<String>,
    /// Outpoints (`txid:vout`) not to spend
    pub utxos_to_exclude: Vec<String>,
}

impl CreateTxOpts {
    pub fn new(outputs: Vec<ProposalOutput>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    /// Total of the outputs, saturating at `u64::MAX`
    pub fn amount(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |sum, o| sum.saturating_add(o.amount))
    }
}

impl ProposalEngine {
    /// Build and store a new `temporary` proposal.
    ///
    /// Calling again with the same `tx_proposal_id` returns the stored
    /// proposal unchanged, whatever its status.
    pub async fn create_tx(
        &self,
        ctx: &CopayerContext,
        opts: CreateTxOpts,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;

        if let Some(id) = &opts.tx_proposal_id {
            if let Some(existing) = self.storage.fetch_proposal(&policy.id, id).await? {
                log::debug!("Proposal {} already exists", id);
                return Ok(existing);
            }
        }

        let adapter = self.adapter(policy.coin);
        self.validate_create(&policy, adapter.as_ref(), &opts)?;

        let recent = self
            .storage
            .fetch_recent_proposals(&policy.id, self.backoff.lookback())
            .await?;
        self.backoff.check(&recent, self.clock.now())?;

        let (fee_mode, fee_level) = self.resolve_fee_mode(&policy, &opts).await?;

        let policy = &policy;
        let opts = &opts;
        let adapter = adapter.as_ref();
        self.locks
            .with_lock(&policy.id, move || {
                self.build_locked(ctx, policy, adapter, opts, fee_mode, fee_level)
            })
            .await
    }

    fn validate_create(
        &self,
        policy: &WalletPolicy,
        adapter: &dyn ChainAdapter,
        opts: &CreateTxOpts,
    ) -> Result<()> {
        let caps = adapter.capabilities();

        if opts.outputs.is_empty() {
            return Err(TxpError::InvalidParams("no outputs".to_string()));
        }
        if opts.send_max && opts.outputs.len() != 1 {
            return Err(TxpError::InvalidParams(
                "send max requires exactly one output".to_string(),
            ));
        }
        if caps.family == CoinFamily::Account && opts.outputs.len() != 1 {
            return Err(TxpError::InvalidParams(format!(
                "{} proposals carry exactly one output",
                policy.coin
            )));
        }

        for output in &opts.outputs {
            adapter.validate_address(&output.to_address, policy.network)?;
            if !opts.send_max && (output.amount == 0 || output.amount < caps.dust_threshold) {
                return Err(TxpError::DustAmount);
            }
        }
        opts.outputs
            .iter()
            .try_fold(0u64, |sum, o| sum.checked_add(o.amount))
            .ok_or_else(|| TxpError::InvalidParams("total output amount overflows".to_string()))?;

        let fee_options = [
            opts.fee_level.is_some(),
            opts.fee_per_kb.is_some(),
            opts.fee.is_some(),
        ];
        if fee_options.iter().filter(|set| **set).count() > 1 {
            return Err(TxpError::InvalidParams(
                "only one of fee_level, fee_per_kb and fee may be given".to_string(),
            ));
        }
        if let Some(level) = &opts.fee_level {
            if self.config.fees.level(policy.coin, level).is_none() {
                return Err(TxpError::InvalidFeeLevel(level.clone()));
            }
        }
        if let Some(rate) = opts.fee_per_kb {
            if rate < caps.min_fee_per_kb || rate > caps.max_fee_per_kb {
                return Err(TxpError::InvalidParams(format!(
                    "fee_per_kb {} outside [{}, {}]",
                    rate, caps.min_fee_per_kb, caps.max_fee_per_kb
                )));
            }
        }
        Ok(())
    }

    async fn resolve_fee_mode(
        &self,
        policy: &WalletPolicy,
        opts: &CreateTxOpts,
    ) -> Result<(FeeMode, Option<String>)> {
        if let Some(fee) = opts.fee {
            return Ok((FeeMode::Fixed(fee), None));
        }
        if let Some(rate) = opts.fee_per_kb {
            return Ok((FeeMode::PerKb(rate), None));
        }

        let level = match &opts.fee_level {
            Some(level) => level.clone(),
            None => self
                .config
                .fees
                .level(policy.coin, DEFAULT_FEE_LEVEL)
                .or_else(|| self.config.fees.levels(policy.coin).first())
                .map(|l| l.name.clone())
                .ok_or_else(|| TxpError::InvalidFeeLevel(DEFAULT_FEE_LEVEL.to_string()))?,
        };
        let rate = resolve_fee_per_kb(
            self.provider.as_ref(),
            policy.coin,
            policy.network,
            &self.config.fees,
            &level,
        )
        .await?;
        Ok((FeeMode::PerKb(rate), Some(level)))
    }

    async fn build_locked(
        &self,
        ctx: &CopayerContext,
        policy: &WalletPolicy,
        adapter: &dyn ChainAdapter,
        opts: &CreateTxOpts,
        fee_mode: FeeMode,
        fee_level: Option<String>,
    ) -> Result<TransactionProposal> {
        // a request with the same id may have finished while we waited
        if let Some(id) = &opts.tx_proposal_id {
            if let Some(existing) = self.storage.fetch_proposal(&policy.id, id).await? {
                return Ok(existing);
            }
        }

        let now = self.clock.now();
        let id = opts
            .tx_proposal_id
            .clone()
            .unwrap_or_else(|| TransactionProposal::generate_id(&policy.id, &ctx.copayer_id, now));

        let mut txp =
            TransactionProposal::new(id, policy, &ctx.copayer_id, opts.outputs.clone(), now);
        txp.message = opts.message.clone();
        txp.fee_level = fee_level;
        txp.fee_per_kb = match fee_mode {
            FeeMode::PerKb(rate) => Some(rate),
            FeeMode::Fixed(_) => None,
        };
        txp.send_max = opts.send_max;
        txp.exclude_unconfirmed_utxos = opts.exclude_unconfirmed_utxos;

        match adapter.capabilities().family {
            CoinFamily::Utxo => {
                self.fund_from_utxos(policy, adapter, opts, fee_mode, &mut txp)
                    .await?
            }
            CoinFamily::Account => {
                self.fund_from_account(policy, adapter, opts, fee_mode, &mut txp)
                    .await?
            }
        }

        let n_outputs = txp.outputs.len() + usize::from(txp.change_amount > 0);
        let mut output_order: Vec<usize> = (0..n_outputs).collect();
        if !opts.no_shuffle_outputs {
            output_order.shuffle(&mut rand::thread_rng());
        }
        txp.output_order = output_order;

        // must encode before anyone is asked to sign it
        adapter.build_unsigned_template(&txp)?;

        if !self.storage.create_proposal(&txp).await? {
            return self.proposal_for(ctx, &txp.id).await;
        }

        log::info!(
            "Created proposal {} on wallet {}: {} to {} outputs, fee {}, {} inputs",
            txp.id,
            policy.id,
            txp.amount(),
            txp.outputs.len(),
            txp.fee,
            txp.inputs.len()
        );
        Ok(txp)
    }

    async fn fund_from_utxos(
        &self,
        policy: &WalletPolicy,
        adapter: &dyn ChainAdapter,
        opts: &CreateTxOpts,
        fee_mode: FeeMode,
        txp: &mut TransactionProposal,
    ) -> Result<()> {
        let addresses = self.storage.fetch_wallet_addresses(&policy.id).await?;
        let address_list: Vec<String> = addresses.iter().map(|a| a.address.clone()).collect();
        let utxos = self
            .provider
            .get_utxos(policy.coin, policy.network, &address_list)
            .await?;
        let locked = self.locks.locked_inputs(&policy.id).await?;

        let (available, reserved): (Vec<Utxo>, Vec<Utxo>) = utxos
            .into_iter()
            .partition(|u| !locked.contains(&u.outpoint()));

        let mut params = SelectionParams::new(
            opts.outputs.iter().map(|o| o.amount).collect(),
            fee_mode,
            policy.m,
            policy.n,
        );
        params.exclude_unconfirmed = opts.exclude_unconfirmed_utxos;
        params.utxos_to_exclude = opts.utxos_to_exclude.iter().cloned().collect();
        params.send_max = opts.send_max;

        let selector = UtxoSelector::new(adapter, &self.config.selection);
        let selection = match selector.select(&available, &params) {
            Err(TxpError::InsufficientFunds)
                if !reserved.is_empty()
                    && total_satoshis(available.iter().chain(reserved.iter()))
                        >= params.amount() =>
            {
                return Err(TxpError::LockedFunds);
            }
            other => other?,
        };

        txp.inputs = selection
            .inputs
            .iter()
            .map(|utxo| {
                let mut input = ProposalInput::from(utxo);
                if input.path.is_empty() {
                    if let Some(known) = addresses.iter().find(|a| a.address == utxo.address) {
                        input.path = known.path.clone();
                    }
                }
                input
            })
            .collect();
        txp.fee = selection.fee;
        if opts.send_max {
            txp.outputs[0].amount = selection.amount;
        }

        if selection.change > 0 {
            txp.change_amount = selection.change;
            // single-address wallets get change back on the first input's address
            txp.change_address = if policy.single_address {
                None
            } else {
                Some(self.storage.create_change_address(&policy.id).await?.address)
            };
        }
        Ok(())
    }

    async fn fund_from_account(
        &self,
        policy: &WalletPolicy,
        adapter: &dyn ChainAdapter,
        opts: &CreateTxOpts,
        fee_mode: FeeMode,
        txp: &mut TransactionProposal,
    ) -> Result<()> {
        let from = self
            .storage
            .fetch_wallet_addresses(&policy.id)
            .await?
            .into_iter()
            .next()
            .map(|a| a.address)
            .ok_or_else(|| TxpError::InvalidParams("wallet has no account address".to_string()))?;

        let balance = self
            .provider
            .get_balance(policy.coin, policy.network, &from)
            .await?;
        let reserved = self.reserved_by_open_proposals(&policy.id).await?;
        let available = balance.saturating_sub(reserved);

        let fee = match fee_mode {
            FeeMode::PerKb(gas_price) => adapter.fee_for(gas_price, 0, 1, policy.m, policy.n),
            FeeMode::Fixed(fee) => fee,
        };

        if opts.send_max {
            if available <= fee {
                return Err(TxpError::InsufficientFundsForFee);
            }
            txp.outputs[0].amount = available - fee;
        } else {
            let amount = opts.amount();
            if available < amount {
                return Err(if balance >= amount {
                    TxpError::LockedFunds
                } else {
                    TxpError::InsufficientFunds
                });
            }
            if available < amount.saturating_add(fee) {
                return Err(TxpError::InsufficientFundsForFee);
            }
        }

        txp.fee = fee;
        txp.from_address = Some(from);
        Ok(())
    }

    /// Amount plus fee of every open proposal of a wallet
    async fn reserved_by_open_proposals(&self, wallet_id: &str) -> Result<u64> {
        Ok(self
            .storage
            .fetch_pending_proposals(wallet_id)
            .await?
            .iter()
            .map(|p| p.amount() + p.fee)
            .sum())
    }

    /// Publish a `temporary` proposal with the creator's signature over its
    /// content. Publishing an already published proposal returns it as is.
    ///
    /// # Errors
    /// - `NotAuthorized` if the caller is not the creator
    /// - `BadSignatures` if the signature does not verify
    /// - `UnavailableUtxos` if an input was spent or reserved meanwhile
    pub async fn publish_tx(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
        proposal_signature: &str,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;
        let txp = self.proposal_for(ctx, proposal_id).await?;

        if txp.creator_id != ctx.copayer_id {
            return Err(TxpError::NotAuthorized(format!(
                "only the creator may publish proposal {}",
                txp.id
            )));
        }
        if txp.status != ProposalStatus::Temporary {
            return Ok(txp);
        }

        let creator = policy
            .copayer(&ctx.copayer_id)
            .ok_or_else(|| TxpError::NotAuthorized(ctx.copayer_id.clone()))?;
        if !verify_hex_signature(
            &creator.request_pub_key,
            &txp.signing_hash(),
            proposal_signature,
        ) {
            return Err(TxpError::BadSignatures);
        }

        let policy = &policy;
        let proposal_id = txp.id.as_str();
        self.locks
            .with_lock(&policy.id, move || {
                self.publish_locked(policy, proposal_id, proposal_signature)
            })
            .await
    }

    async fn publish_locked(
        &self,
        policy: &WalletPolicy,
        proposal_id: &str,
        proposal_signature: &str,
    ) -> Result<TransactionProposal> {
        // a concurrent publish may have committed while we waited
        let txp = self
            .storage
            .fetch_proposal(&policy.id, proposal_id)
            .await?
            .ok_or_else(|| TxpError::TxNotFound(proposal_id.to_string()))?;
        if txp.status != ProposalStatus::Temporary {
            return Ok(txp);
        }

        match self.adapter(policy.coin).capabilities().family {
            CoinFamily::Utxo => {
                let addresses: Vec<String> = txp
                    .inputs
                    .iter()
                    .map(|i| i.address.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let unspent: HashSet<String> = self
                    .provider
                    .get_utxos(policy.coin, policy.network, &addresses)
                    .await?
                    .iter()
                    .map(|u| u.outpoint())
                    .collect();
                let locked = self.locks.locked_inputs(&policy.id).await?;

                let unavailable = txp.inputs.iter().any(|input| {
                    let outpoint = input.outpoint();
                    !unspent.contains(&outpoint) || locked.contains(&outpoint)
                });
                if unavailable {
                    log::info!("Inputs of proposal {} are no longer available", txp.id);
                    return Err(TxpError::UnavailableUtxos);
                }
            }
            CoinFamily::Account => {
                let from = txp.from_address.as_deref().unwrap_or_default();
                let balance = self
                    .provider
                    .get_balance(policy.coin, policy.network, from)
                    .await?;
                let reserved = self.reserved_by_open_proposals(&policy.id).await?;
                if balance.saturating_sub(reserved) < txp.amount() + txp.fee {
                    return Err(TxpError::LockedFunds);
                }
            }
        }

        let patch = StatusPatch {
            proposal_signature: Some(proposal_signature.to_string()),
            ..Default::default()
        };
        let transitioned = self
            .storage
            .transition_status(
                &policy.id,
                &txp.id,
                ProposalStatus::Temporary,
                ProposalStatus::Pending,
                patch,
            )
            .await?;

        match transitioned {
            Some(published) => {
                log::info!("Published proposal {} on wallet {}", published.id, policy.id);
                self.emit(ProposalEvent::NewTxProposal {
                    wallet_id: policy.id.clone(),
                    proposal_id: published.id.clone(),
                    creator_id: published.creator_id.clone(),
                    amount: published.amount(),
                });
                Ok(published)
            }
            // published by a concurrent call
            None => self
                .storage
                .fetch_proposal(&policy.id, &txp.id)
                .await?
                .ok_or_else(|| TxpError::TxNotFound(txp.id.clone())),
        }
    }
}
