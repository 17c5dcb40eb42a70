//! Signing and rejection
//!
//! A proposal's votes are an append-only action log. Thresholds are derived
//! by counting it: `m` accepts finalize it as accepted, `n - m + 1` rejects
//! as rejected, and since the two add up to `n + 1` only one can be reached.
//! Both the append and the final transition are conditional storage
//! operations, so racing voters are never double counted and the final
//! transition fires exactly once.
//!
//! The vote and the final transition are two writes. A `pending` proposal
//! whose log already reaches a threshold is finished by the next call that
//! reads it (`settle`).

use super::{CopayerContext, ProposalEngine, ProposalEvent};
use crate::chain::ChainAdapter;
use crate::core::{
    ProposalAction, ProposalStatus, Result, TransactionProposal, TxpError, WalletPolicy,
};
use crate::crypto::verify_hex_signature;
use crate::storage::{AppendOutcome, StatusPatch};

impl ProposalEngine {
    /// Accept a pending proposal with one signature per signing slot.
    ///
    /// # Errors
    /// - `CopayerVoted` if the caller already acted on the proposal
    /// - `TxNotPending` if it is not `pending`
    /// - `BadSignatures` if any signature fails verification
    pub async fn sign_tx(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
        signatures: Vec<String>,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;
        let txp = self.proposal_for(ctx, proposal_id).await?;
        let txp = self.settle(&policy, txp).await?;
        check_can_vote(&txp, &ctx.copayer_id)?;

        let copayer = policy
            .copayer(&ctx.copayer_id)
            .ok_or_else(|| TxpError::NotAuthorized(ctx.copayer_id.clone()))?;
        let adapter = self.adapter(policy.coin);
        let template = adapter.build_unsigned_template(&txp)?;

        if signatures.len() != template.signing_slots() {
            log::info!(
                "Copayer {} sent {} signatures for {} slots on proposal {}",
                ctx.copayer_id,
                signatures.len(),
                template.signing_slots(),
                txp.id
            );
            return Err(TxpError::BadSignatures);
        }
        for (index, signature) in signatures.iter().enumerate() {
            let digest = adapter.sighash(&template, index)?;
            if !verify_hex_signature(&copayer.signing_pub_key, &digest, signature) {
                log::info!(
                    "Invalid signature from copayer {} on proposal {} slot {}",
                    ctx.copayer_id,
                    txp.id,
                    index
                );
                return Err(TxpError::BadSignatures);
            }
        }

        let required = usize::from(txp.required_signatures);
        if txp.accept_count() + 1 >= required {
            // the vote that completes the quorum must yield a valid transaction
            let mut sets = signature_sets(&txp, required);
            sets.push(signatures.clone());
            sets.truncate(required);
            if let Err(e) = adapter.apply_signatures(&template, &sets) {
                log::warn!("Cannot assemble proposal {}: {}", txp.id, e);
                return Err(TxpError::BadSignatures);
            }
        }

        let action = ProposalAction::accept(&ctx.copayer_id, signatures, self.clock.now());
        let txp = self.append_vote(&policy, &txp.id, action).await?;
        log::info!(
            "Copayer {} signed proposal {} ({}/{})",
            ctx.copayer_id,
            txp.id,
            txp.accept_count(),
            txp.required_signatures
        );
        self.emit(ProposalEvent::TxProposalAcceptedBy {
            wallet_id: policy.id.clone(),
            proposal_id: txp.id.clone(),
            copayer_id: ctx.copayer_id.clone(),
        });

        if txp.is_accepted() {
            return self.finalize_accepted(&policy, adapter.as_ref(), txp).await;
        }
        Ok(txp)
    }

    /// Reject a pending proposal.
    ///
    /// # Errors
    /// Same guards as `sign_tx`, minus signature checks
    pub async fn reject_tx(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
        reason: Option<String>,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;
        let txp = self.proposal_for(ctx, proposal_id).await?;
        let txp = self.settle(&policy, txp).await?;
        check_can_vote(&txp, &ctx.copayer_id)?;

        let action = ProposalAction::reject(&ctx.copayer_id, reason, self.clock.now());
        let txp = self.append_vote(&policy, &txp.id, action).await?;
        log::info!(
            "Copayer {} rejected proposal {} ({}/{})",
            ctx.copayer_id,
            txp.id,
            txp.reject_count(),
            txp.required_rejections
        );
        self.emit(ProposalEvent::TxProposalRejectedBy {
            wallet_id: policy.id.clone(),
            proposal_id: txp.id.clone(),
            copayer_id: ctx.copayer_id.clone(),
        });

        if txp.is_rejected() {
            return self.finalize_rejected(&policy, txp).await;
        }
        Ok(txp)
    }

    /// Finish a `pending` proposal whose action log already reaches the
    /// accept or reject threshold; anything else is returned as is
    pub(super) async fn settle(
        &self,
        policy: &WalletPolicy,
        txp: TransactionProposal,
    ) -> Result<TransactionProposal> {
        if txp.status != ProposalStatus::Pending {
            return Ok(txp);
        }
        if txp.is_accepted() {
            log::info!("Finishing accepted proposal {}", txp.id);
            let adapter = self.adapter(policy.coin);
            return self.finalize_accepted(policy, adapter.as_ref(), txp).await;
        }
        if txp.is_rejected() {
            log::info!("Finishing rejected proposal {}", txp.id);
            return self.finalize_rejected(policy, txp).await;
        }
        Ok(txp)
    }

    async fn finalize_rejected(
        &self,
        policy: &WalletPolicy,
        txp: TransactionProposal,
    ) -> Result<TransactionProposal> {
        let transitioned = self
            .storage
            .transition_status(
                &policy.id,
                &txp.id,
                ProposalStatus::Pending,
                ProposalStatus::Rejected,
                StatusPatch::default(),
            )
            .await?;
        match transitioned {
            Some(rejected) => {
                log::info!("Proposal {} finally rejected", rejected.id);
                self.emit(ProposalEvent::TxProposalFinallyRejected {
                    wallet_id: policy.id.clone(),
                    proposal_id: rejected.id.clone(),
                });
                Ok(rejected)
            }
            None => self.current(policy, &txp.id).await,
        }
    }

    async fn append_vote(
        &self,
        policy: &WalletPolicy,
        proposal_id: &str,
        action: ProposalAction,
    ) -> Result<TransactionProposal> {
        match self
            .storage
            .append_action(&policy.id, proposal_id, action)
            .await?
        {
            AppendOutcome::Appended(txp) => Ok(txp),
            AppendOutcome::AlreadyVoted => Err(TxpError::CopayerVoted),
            AppendOutcome::NotPending => Err(TxpError::TxNotPending),
            AppendOutcome::NotFound => Err(TxpError::TxNotFound(proposal_id.to_string())),
        }
    }

    /// Assemble the signed transaction from the first `m` accepts and move
    /// the proposal to `accepted`
    async fn finalize_accepted(
        &self,
        policy: &WalletPolicy,
        adapter: &dyn ChainAdapter,
        txp: TransactionProposal,
    ) -> Result<TransactionProposal> {
        let template = adapter.build_unsigned_template(&txp)?;
        let sets = signature_sets(&txp, usize::from(txp.required_signatures));
        let raw_tx = adapter.apply_signatures(&template, &sets)?;
        let txid = adapter.compute_txid(&raw_tx)?;

        let patch = StatusPatch {
            raw_tx: Some(raw_tx),
            txid: Some(txid),
            ..Default::default()
        };
        let transitioned = self
            .storage
            .transition_status(
                &policy.id,
                &txp.id,
                ProposalStatus::Pending,
                ProposalStatus::Accepted,
                patch,
            )
            .await?;

        match transitioned {
            Some(accepted) => {
                log::info!(
                    "Proposal {} finally accepted, txid {}",
                    accepted.id,
                    accepted.txid.as_deref().unwrap_or_default()
                );
                self.emit(ProposalEvent::TxProposalFinallyAccepted {
                    wallet_id: policy.id.clone(),
                    proposal_id: accepted.id.clone(),
                });
                Ok(accepted)
            }
            // a concurrent voter finalized it first
            None => self.current(policy, &txp.id).await,
        }
    }

    async fn current(&self, policy: &WalletPolicy, proposal_id: &str) -> Result<TransactionProposal> {
        self.storage
            .fetch_proposal(&policy.id, proposal_id)
            .await?
            .ok_or_else(|| TxpError::TxNotFound(proposal_id.to_string()))
    }
}

fn check_can_vote(txp: &TransactionProposal, copayer_id: &str) -> Result<()> {
    if txp.action_by(copayer_id).is_some() {
        return Err(TxpError::CopayerVoted);
    }
    if txp.status != ProposalStatus::Pending {
        return Err(TxpError::TxNotPending);
    }
    Ok(())
}

/// Signature sets of the first `limit` accept actions, in signing order
fn signature_sets(txp: &TransactionProposal, limit: usize) -> Vec<Vec<String>> {
    txp.accept_actions()
        .filter_map(|a| a.signatures.clone())
        .take(limit)
        .collect()
}
