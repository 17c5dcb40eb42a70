//! Transaction proposal engine
//!
//! The service facade over the proposal lifecycle:
//! - `create_tx` / `publish_tx` (builder)
//! - `sign_tx` / `reject_tx` (quorum)
//! - `broadcast_tx` / `remove_pending_tx` (broadcast)
//! - `get_pending_txs`, `get_tx`, `get_fee_levels`
//!
//! Every call carries the calling copayer's context. The engine keeps no
//! mutable state of its own; everything lives in the datastore.

pub mod backoff;
pub mod broadcast;
pub mod builder;
pub mod events;
pub mod quorum;


pub use backoff::BackoffGovernor;
pub use builder::CreateTxOpts;
pub use events::{EventBroadcaster, LogNotifier, Notifier, ProposalEvent};

use crate::chain::{adapter_for, ChainAdapter};
use crate::core::fee::{fetch_fee_levels, FeeLevelEstimate};
use crate::core::{
    Clock, Coin, EngineConfig, Network, Result, SystemClock, TransactionProposal, TxpError,
    WalletPolicy,
};
use crate::locking::LockCoordinator;
use crate::provider::BlockchainProvider;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identity of the caller of an engine operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopayerContext {
    pub wallet_id: String,
    pub copayer_id: String,
}

impl CopayerContext {
    pub fn new(wallet_id: impl Into<String>, copayer_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            copayer_id: copayer_id.into(),
        }
    }
}

/// The proposal engine
pub struct ProposalEngine {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn BlockchainProvider>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    locks: LockCoordinator,
    backoff: BackoffGovernor,
    config: EngineConfig,
}

impl ProposalEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn adapter(&self, coin: Coin) -> Arc<dyn ChainAdapter> {
        adapter_for(coin)
    }

    fn emit(&self, event: ProposalEvent) {
        self.notifier.notify(event);
    }

    /// Load the caller's wallet, checking membership and completeness
    async fn wallet_for(&self, ctx: &CopayerContext) -> Result<WalletPolicy> {
        let policy = self
            .storage
            .fetch_wallet_policy(&ctx.wallet_id)
            .await?
            .ok_or_else(|| TxpError::WalletNotFound(ctx.wallet_id.clone()))?;

        if policy.copayer(&ctx.copayer_id).is_none() {
            return Err(TxpError::NotAuthorized(ctx.copayer_id.clone()));
        }
        if !policy.is_complete() {
            return Err(TxpError::WalletNotComplete);
        }
        Ok(policy)
    }

    async fn proposal_for(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
    ) -> Result<TransactionProposal> {
        self.storage
            .fetch_proposal(&ctx.wallet_id, proposal_id)
            .await?
            .ok_or_else(|| TxpError::TxNotFound(proposal_id.to_string()))
    }

    /// Open proposals of the caller's wallet, newest first, with their
    /// remaining delete lock filled in
    pub async fn get_pending_txs(&self, ctx: &CopayerContext) -> Result<Vec<TransactionProposal>> {
        let policy = self.wallet_for(ctx).await?;

        let now = self.clock.now();
        let delete_lock = self.config.delete_lock();
        let mut proposals = Vec::new();
        for txp in self.storage.fetch_pending_proposals(&ctx.wallet_id).await? {
            let mut txp = self.settle(&policy, txp).await?;
            if txp.status.is_open() {
                txp.delete_lock_time = txp.remaining_delete_lock_secs(now, delete_lock);
                proposals.push(txp);
            }
        }
        Ok(proposals)
    }

    /// One proposal of the caller's wallet
    pub async fn get_tx(
        &self,
        ctx: &CopayerContext,
        proposal_id: &str,
    ) -> Result<TransactionProposal> {
        let policy = self.wallet_for(ctx).await?;
        let txp = self.proposal_for(ctx, proposal_id).await?;
        let mut txp = self.settle(&policy, txp).await?;
        if txp.status.is_open() {
            txp.delete_lock_time =
                txp.remaining_delete_lock_secs(self.clock.now(), self.config.delete_lock());
        }
        Ok(txp)
    }

    /// Resolved fee levels for a coin and network
    pub async fn get_fee_levels(
        &self,
        coin: Coin,
        network: Network,
    ) -> Vec<FeeLevelEstimate> {
        fetch_fee_levels(self.provider.as_ref(), coin, network, &self.config.fees).await
    }
}

/// Assembles a `ProposalEngine` from its collaborators
pub struct EngineBuilder {
    storage: Option<Arc<dyn Storage>>,
    provider: Option<Arc<dyn BlockchainProvider>>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            storage: None,
            provider: None,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            config: EngineConfig::default(),
        }
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn BlockchainProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    /// `InvalidParams` if storage or provider is missing or the
    /// configuration does not validate
    pub fn build(self) -> Result<ProposalEngine> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| TxpError::InvalidParams("storage is required".to_string()))?;
        let provider = self
            .provider
            .ok_or_else(|| TxpError::InvalidParams("provider is required".to_string()))?;

        let locks = LockCoordinator::new(
            storage.clone(),
            self.clock.clone(),
            self.config.lock.clone(),
        );
        let backoff = BackoffGovernor::new(&self.config.backoff);

        Ok(ProposalEngine {
            storage,
            provider,
            clock: self.clock,
            notifier: self.notifier,
            locks,
            backoff,
            config: self.config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
