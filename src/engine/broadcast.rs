//! Broadcasting and removal

use super::{CopayerContext, ProposalEngine, ProposalEvent};
use crate::core::{ProposalStatus, Result, TransactionProposal, TxpError, WalletPolicy};
use crate::storage::StatusPatch;

/// Times a removal is re-evaluated when the proposal changes underneath it
const REMOVE_ATTEMPTS: usize = 3;

const REMOVABLE: [ProposalStatus; 2] = [ProposalStatus::Pending, ProposalStatus::Accepted];

impl ProposalEngine {
    /// Submit an accepted proposal's signed transaction to the network.
    ///
    /// A failed submission is reconciled against the network before the
    /// error is surfaced: if the transaction is already known there, the
    /// proposal is marked broadcasted by a third party. Otherwise it stays
    /// `accepted` and the call can be retried.
    ///
    /// # Errors
    /// - `TxAlreadyBroadcasted` if it was broadcasted before
    /// - `TxNotAccepted` for any other non-accepted status
    /// - `Upstream` with the provider's submission error
    pub async fn broadcast_tx(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;
        let txp = self.proposal_for(ctx, proposal_id).await?;
        let txp = self.settle(&policy, txp).await?;

        match txp.status {
            ProposalStatus::Accepted => {}
            ProposalStatus::Broadcasted => return Err(TxpError::TxAlreadyBroadcasted),
            _ => return Err(TxpError::TxNotAccepted),
        }
        let raw_tx = txp.raw_tx.as_deref().ok_or_else(|| {
            TxpError::ChainAdapter(format!("accepted proposal {} has no raw transaction", txp.id))
        })?;

        match self
            .provider
            .broadcast(policy.coin, policy.network, raw_tx)
            .await
        {
            Ok(txid) => self.mark_broadcasted(&policy, &txp, txid, false).await,
            Err(err) => {
                log::warn!("Broadcast of proposal {} failed: {}", txp.id, err);
                let local_txid = txp.txid.as_deref().unwrap_or_default();
                match self
                    .provider
                    .get_transaction(policy.coin, policy.network, local_txid)
                    .await
                {
                    Ok(Some(found)) => {
                        log::info!(
                            "Transaction {} of proposal {} is already on the network",
                            found.txid,
                            txp.id
                        );
                        self.mark_broadcasted(&policy, &txp, found.txid, true).await
                    }
                    Ok(None) => Err(TxpError::Upstream(err)),
                    Err(lookup) => {
                        log::warn!("Could not look up transaction {}: {}", local_txid, lookup);
                        Err(TxpError::Upstream(err))
                    }
                }
            }
        }
    }

    async fn mark_broadcasted(
        &self,
        policy: &WalletPolicy,
        txp: &TransactionProposal,
        txid: String,
        by_third_party: bool,
    ) -> Result<TransactionProposal> {
        let patch = StatusPatch {
            txid: Some(txid.clone()),
            broadcasted_on: Some(self.clock.now()),
            ..Default::default()
        };
        let transitioned = self
            .storage
            .transition_status(
                &policy.id,
                &txp.id,
                ProposalStatus::Accepted,
                ProposalStatus::Broadcasted,
                patch,
            )
            .await?;

        let Some(broadcasted) = transitioned else {
            // another broadcast call committed first
            let current = self
                .storage
                .fetch_proposal(&policy.id, &txp.id)
                .await?
                .ok_or_else(|| TxpError::TxNotFound(txp.id.clone()))?;
            return match current.status {
                ProposalStatus::Broadcasted => Ok(current),
                _ => Err(TxpError::TxNotAccepted),
            };
        };

        log::info!("Proposal {} broadcasted as {}", broadcasted.id, txid);
        let wallet_id = policy.id.clone();
        let proposal_id = broadcasted.id.clone();
        self.emit(if by_third_party {
            ProposalEvent::NewOutgoingTxByThirdParty {
                wallet_id,
                proposal_id,
                txid,
            }
        } else {
            ProposalEvent::NewOutgoingTx {
                wallet_id,
                proposal_id,
                txid,
            }
        });
        Ok(broadcasted)
    }

    /// Remove an open proposal, releasing its inputs.
    ///
    /// The creator may remove it until another copayer acts. After that,
    /// anyone may once the delete lock since the last such action expires.
    ///
    /// # Errors
    /// - `TxNotPending` unless the proposal is `pending` or `accepted`
    /// - `TxCannotRemove` while the caller is not allowed to remove it
    pub async fn remove_pending_tx(&self, ctx: &CopayerContext, proposal_id: &str) -> Result<()> {
        let policy = self.wallet_for(ctx).await?;
        let delete_lock = self.config.delete_lock();

        for _ in 0..REMOVE_ATTEMPTS {
            let txp = self.proposal_for(ctx, proposal_id).await?;
            if !txp.status.is_open() {
                return Err(TxpError::TxNotPending);
            }
            if !txp.can_be_removed_by(&ctx.copayer_id, self.clock.now(), delete_lock) {
                return Err(TxpError::TxCannotRemove);
            }

            let removed = self
                .storage
                .remove_proposal(&policy.id, &txp.id, &REMOVABLE, txp.actions.len())
                .await?;
            if removed {
                log::info!("Copayer {} removed proposal {}", ctx.copayer_id, txp.id);
                self.emit(ProposalEvent::TxProposalRemoved {
                    wallet_id: policy.id.clone(),
                    proposal_id: txp.id.clone(),
                    copayer_id: ctx.copayer_id.clone(),
                });
                return Ok(());
            }
            log::debug!("Proposal {} changed during removal, re-checking", txp.id);
        }
        Err(TxpError::TxCannotRemove)
    }
}
