//! Local datastore
//!
//! All state sits behind one mutex, so each operation is atomic. The
//! persistence strategy decides whether a snapshot is written after each
//! mutation (`FileStorage`) or not at all (`MemoryStorage`).

use super::persistence::{Persistence, SnapshotFile, Volatile};
use super::state::StoreState;
use super::{AppendOutcome, LeaseGrant, StatusPatch, Storage, StorageError};
use crate::core::{
    ProposalAction, ProposalStatus, TransactionProposal, WalletAddress, WalletPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Datastore held in process memory
pub struct LocalStorage<P: Persistence = Volatile> {
    state: Mutex<StoreState>,
    persistence: P,
}

/// Process-local store; state is lost on exit
pub type MemoryStorage = LocalStorage<Volatile>;

/// Store snapshotted to a data directory after every mutation
pub type FileStorage = LocalStorage<SnapshotFile>;

impl LocalStorage<Volatile> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            persistence: Volatile,
        }
    }
}

impl Default for LocalStorage<Volatile> {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStorage<SnapshotFile> {
    /// Open a data directory, restoring the last snapshot if present
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        let snapshot = SnapshotFile::new(data_dir)?;
        let state = snapshot.load()?;
        if snapshot.exists() {
            log::debug!("Restored store snapshot {}", snapshot.path().display());
        }
        Ok(Self {
            state: Mutex::new(state),
            persistence: snapshot,
        })
    }
}

impl<P: Persistence> LocalStorage<P> {
    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&state))
    }

    /// Apply `f` to a copy of the state; the copy replaces the state only
    /// once it is persisted, so a failed save changes nothing
    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        let mut next = state.clone();
        let out = f(&mut next);
        self.persistence.save(&next)?;
        *state = next;
        Ok(out)
    }

    /// Register a wallet and its known addresses
    pub fn insert_wallet(
        &self,
        policy: WalletPolicy,
        addresses: Vec<WalletAddress>,
    ) -> Result<(), StorageError> {
        self.write(|state| state.insert_wallet(policy, addresses))
    }
}

#[async_trait]
impl<P: Persistence> Storage for LocalStorage<P> {
    async fn fetch_wallet_policy(
        &self,
        wallet_id: &str,
    ) -> Result<Option<WalletPolicy>, StorageError> {
        self.read(|state| state.wallet(wallet_id).map(|w| w.policy.clone()))
    }

    async fn fetch_wallet_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletAddress>, StorageError> {
        self.read(|state| {
            state
                .wallet(wallet_id)
                .map(|w| w.addresses.clone())
                .unwrap_or_default()
        })
    }

    async fn create_change_address(
        &self,
        wallet_id: &str,
    ) -> Result<WalletAddress, StorageError> {
        self.write(|state| state.create_change_address(wallet_id))?
            .ok_or_else(|| StorageError::InvalidData(format!("unknown wallet {}", wallet_id)))
    }

    async fn fetch_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
    ) -> Result<Option<TransactionProposal>, StorageError> {
        self.read(|state| state.proposal(wallet_id, proposal_id).cloned())
    }

    async fn fetch_locked_inputs(&self, wallet_id: &str) -> Result<HashSet<String>, StorageError> {
        self.read(|state| state.locked_inputs(wallet_id))
    }

    async fn fetch_pending_proposals(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<TransactionProposal>, StorageError> {
        self.read(|state| state.proposals_where(wallet_id, |p| p.status.is_open()))
    }

    async fn fetch_recent_proposals(
        &self,
        wallet_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionProposal>, StorageError> {
        self.read(|state| {
            let mut recent =
                state.proposals_where(wallet_id, |p| p.status != ProposalStatus::Temporary);
            recent.truncate(limit);
            recent
        })
    }

    async fn create_proposal(&self, proposal: &TransactionProposal) -> Result<bool, StorageError> {
        self.write(|state| state.create_proposal(proposal.clone()))
    }

    async fn append_action(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        action: ProposalAction,
    ) -> Result<AppendOutcome, StorageError> {
        self.write(|state| state.append_action(wallet_id, proposal_id, action))
    }

    async fn transition_status(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        patch: StatusPatch,
    ) -> Result<Option<TransactionProposal>, StorageError> {
        self.write(|state| state.transition_status(wallet_id, proposal_id, from, to, patch))
    }

    async fn remove_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        allowed: &[ProposalStatus],
        expected_actions: usize,
    ) -> Result<bool, StorageError> {
        self.write(|state| {
            state.remove_proposal(wallet_id, proposal_id, allowed, expected_actions)
        })
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseGrant, StorageError> {
        self.write(|state| state.try_acquire_lease(key, token, now, ttl))
    }

    async fn renew_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.write(|state| state.renew_lease(key, token, now, ttl))
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        self.write(|state| state.release_lease(key, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coin, Copayer, Network, ProposalOutput};

    fn policy() -> WalletPolicy {
        WalletPolicy::new(
            "w1",
            1,
            1,
            Coin::Btc,
            Network::Testnet,
            vec![Copayer {
                id: "a".into(),
                name: "a".into(),
                request_pub_key: String::new(),
                signing_pub_key: "key-a".into(),
            }],
        )
        .unwrap()
    }

    fn proposal(id: &str) -> TransactionProposal {
        TransactionProposal::new(
            id.to_string(),
            &policy(),
            "a",
            vec![ProposalOutput {
                to_address: "dest".into(),
                amount: 1_000,
                message: None,
            }],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_recent_excludes_temporary() {
        let storage = MemoryStorage::new();
        storage.insert_wallet(policy(), vec![]).unwrap();

        storage.create_proposal(&proposal("t")).await.unwrap();
        let mut published = proposal("p");
        published.status = ProposalStatus::Rejected;
        storage.create_proposal(&published).await.unwrap();

        let recent = storage.fetch_recent_proposals("w1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "p");
        assert!(storage.fetch_pending_proposals("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let storage = FileStorage::open(temp_dir.path()).unwrap();
            storage.insert_wallet(policy(), vec![]).unwrap();
            storage.create_proposal(&proposal("p1")).await.unwrap();
            storage.create_change_address("w1").await.unwrap();
            let grant = storage
                .try_acquire_lease("w1", "token", now, Duration::seconds(40))
                .await
                .unwrap();
            assert!(grant.is_granted());
        }

        let storage = FileStorage::open(temp_dir.path()).unwrap();
        assert!(storage.fetch_wallet_policy("w1").await.unwrap().is_some());
        assert!(storage.fetch_proposal("w1", "p1").await.unwrap().is_some());
        assert_eq!(storage.fetch_wallet_addresses("w1").await.unwrap().len(), 1);

        // the lease is still held after restart
        let grant = storage
            .try_acquire_lease("w1", "other", now, Duration::seconds(40))
            .await
            .unwrap();
        assert!(!grant.is_granted());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("txp-store.json"), "{not json").unwrap();
        assert!(matches!(
            FileStorage::open(temp_dir.path()),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_snapshot_changes_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data_dir = temp_dir.path().join("store");
        let storage = FileStorage::open(&data_dir).unwrap();
        storage.insert_wallet(policy(), vec![]).unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        assert!(matches!(
            storage.create_proposal(&proposal("p1")).await,
            Err(StorageError::IoError(_))
        ));
        assert!(storage.fetch_proposal("w1", "p1").await.unwrap().is_none());

        // once the directory is back, the same write succeeds and persists
        std::fs::create_dir_all(&data_dir).unwrap();
        assert!(storage.create_proposal(&proposal("p1")).await.unwrap());
        let reopened = FileStorage::open(&data_dir).unwrap();
        assert!(reopened.fetch_proposal("w1", "p1").await.unwrap().is_some());
    }
}
