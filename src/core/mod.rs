//! Core domain types
//!
//! This module contains the building blocks shared by every component:
//! - Wallet policy, copayers and networks
//! - UTXOs and transaction proposals
//! - Fee levels and fee rates
//! - Configuration, time source and errors

pub mod clock;
pub mod config;
pub mod error;
pub mod fee;
pub mod proposal;
pub mod utxo;
pub mod wallet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, EngineConfig, FeeConfig, LockConfig, SelectionConfig};
pub use error::{Result, TxpError};
pub use fee::{FeeLevel, FeeLevelEstimate, FeeRate};
pub use proposal::{
    ActionType, ProposalAction, ProposalInput, ProposalOutput, ProposalStatus,
    TransactionProposal,
};
pub use utxo::Utxo;
pub use wallet::{Coin, Copayer, Network, WalletAddress, WalletPolicy};
