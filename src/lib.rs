//! Multisig TXP: transaction proposals for M-of-N shared wallets
//!
//! This crate provides the proposal engine of a multi-signature wallet
//! service:
//! - UTXO selection with fee settlement and dust folding
//! - Per-wallet lease locking in the shared datastore
//! - Proposal construction, publishing and quorum tracking
//! - Creation backoff after repeated rejections
//! - Broadcasting with third-party reconciliation
//! - UTXO (btc, bch) and account (eth) coin families
//!
//! # Example
//!
//! ```rust,no_run
//! use multisig_txp::engine::{CopayerContext, CreateTxOpts, ProposalEngine};
//! use multisig_txp::core::ProposalOutput;
//! use multisig_txp::storage::MemoryStorage;
//! # use multisig_txp::provider::BlockchainProvider;
//! # use std::sync::Arc;
//! # async fn run(provider: Arc<dyn BlockchainProvider>) -> multisig_txp::core::Result<()> {
//! let engine = ProposalEngine::builder()
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .provider(provider)
//!     .build()?;
//!
//! let ctx = CopayerContext::new("wallet-1", "copayer-1");
//! let opts = CreateTxOpts::new(vec![ProposalOutput {
//!     to_address: "1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string(),
//!     amount: 80_000,
//!     message: None,
//! }]);
//! let txp = engine.create_tx(&ctx, opts).await?;
//! println!("Proposal {} pays {} with fee {}", txp.id, txp.amount(), txp.fee);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod cli;
pub mod core;
pub mod crypto;
pub mod engine;
pub mod locking;
pub mod provider;
pub mod selection;
pub mod storage;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use crate::core::{
    Coin, EngineConfig, Network, ProposalOutput, ProposalStatus, TransactionProposal, TxpError,
    Utxo, WalletPolicy,
};
pub use chain::{adapter_for, ChainAdapter, CoinFamily};
pub use crypto::KeyPair;
pub use engine::{CopayerContext, CreateTxOpts, ProposalEngine, ProposalEvent};
pub use locking::LockCoordinator;
pub use provider::BlockchainProvider;
pub use selection::UtxoSelector;
pub use storage::{FileStorage, MemoryStorage, Storage};
