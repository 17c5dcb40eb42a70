//! Proposal and wallet storage
//!
//! The datastore shared by every engine replica. All mutations are atomic,
//! conditional operations; callers never read-modify-write a proposal.

pub mod memory;
pub mod persistence;
mod state;

pub use memory::{FileStorage, LocalStorage, MemoryStorage};
pub use persistence::{Persistence, SnapshotFile, Volatile};

use crate::core::{
    ProposalAction, ProposalStatus, TransactionProposal, WalletAddress, WalletPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result of a conditional action append
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(TransactionProposal),
    AlreadyVoted,
    NotPending,
    NotFound,
}

/// Fields written together with a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub proposal_signature: Option<String>,
    pub raw_tx: Option<String>,
    pub txid: Option<String>,
    pub broadcasted_on: Option<DateTime<Utc>>,
}

/// Result of a lease acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Acquired,
    /// An expired lease of another holder was taken over
    Reclaimed { previous_token: String },
    Held { expires_at: DateTime<Utc> },
}

impl LeaseGrant {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LeaseGrant::Held { .. })
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn fetch_wallet_policy(
        &self,
        wallet_id: &str,
    ) -> Result<Option<WalletPolicy>, StorageError>;

    async fn fetch_wallet_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletAddress>, StorageError>;

    /// Derive and persist a fresh change address
    async fn create_change_address(&self, wallet_id: &str)
        -> Result<WalletAddress, StorageError>;

    async fn fetch_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
    ) -> Result<Option<TransactionProposal>, StorageError>;

    /// Outpoints reserved by `pending`, `accepted` and `broadcasted` proposals
    async fn fetch_locked_inputs(&self, wallet_id: &str) -> Result<HashSet<String>, StorageError>;

    /// `pending` and `accepted` proposals, newest first
    async fn fetch_pending_proposals(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<TransactionProposal>, StorageError>;

    /// Published proposals of any status, newest first
    async fn fetch_recent_proposals(
        &self,
        wallet_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionProposal>, StorageError>;

    /// Insert if no proposal with the same id exists; returns whether it was
    /// inserted
    async fn create_proposal(&self, proposal: &TransactionProposal) -> Result<bool, StorageError>;

    /// Append only while `pending` and only if the copayer has not acted
    async fn append_action(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        action: ProposalAction,
    ) -> Result<AppendOutcome, StorageError>;

    /// Move from `from` to `to`; `None` if the status was not `from`
    async fn transition_status(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        patch: StatusPatch,
    ) -> Result<Option<TransactionProposal>, StorageError>;

    /// Remove if the status is in `allowed` and the action count is still
    /// `expected_actions`
    async fn remove_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        allowed: &[ProposalStatus],
        expected_actions: usize,
    ) -> Result<bool, StorageError>;

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseGrant, StorageError>;

    /// Extend the lease only if still held by `token`; `false` once it was
    /// reclaimed by someone else
    async fn renew_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Release only if still held by `token`
    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, StorageError>;
}
