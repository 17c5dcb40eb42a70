//! Test fixtures: a scriptable provider, an event recorder and funded
//! wallets with real keys

use crate::chain::adapter_for;
use crate::core::{
    Coin, Copayer, EngineConfig, ManualClock, Network, ProposalAction, ProposalOutput,
    ProposalStatus, Result, TransactionProposal, Utxo, WalletAddress, WalletPolicy,
};
use crate::crypto::{multisig_address, sha256, sha256_hex, KeyPair};
use crate::engine::{CopayerContext, CreateTxOpts, Notifier, ProposalEngine, ProposalEvent};
use crate::provider::{BlockchainProvider, ProviderError, ProviderTx};
use crate::storage::{AppendOutcome, LeaseGrant, MemoryStorage, StatusPatch, Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// =============================================================================
// Provider
// =============================================================================

#[derive(Default)]
struct MockState {
    utxos: Vec<Utxo>,
    balances: HashMap<String, u64>,
    fee_estimates: HashMap<u32, Option<u64>>,
    fee_error: Option<ProviderError>,
    broadcast_error: Option<ProviderError>,
    lookup_error: Option<ProviderError>,
    known_txs: HashMap<String, ProviderTx>,
    broadcasts: Vec<String>,
}

/// In-memory blockchain provider whose answers tests script
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_utxo(&self, utxo: Utxo) {
        self.state.lock().unwrap().utxos.push(utxo);
    }

    /// Forget an output, as if it was spent elsewhere
    pub fn spend(&self, outpoint: &str) {
        self.state
            .lock()
            .unwrap()
            .utxos
            .retain(|u| u.outpoint() != outpoint);
    }

    pub fn set_balance(&self, address: &str, amount: u64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(address.to_string(), amount);
    }

    pub fn set_fee_estimate(&self, target: u32, fee_per_kb: Option<u64>) {
        self.state
            .lock()
            .unwrap()
            .fee_estimates
            .insert(target, fee_per_kb);
    }

    pub fn fail_fee_estimates(&self, error: ProviderError) {
        self.state.lock().unwrap().fee_error = Some(error);
    }

    pub fn fail_broadcasts(&self, error: ProviderError) {
        self.state.lock().unwrap().broadcast_error = Some(error);
    }

    pub fn fail_lookups(&self, error: ProviderError) {
        self.state.lock().unwrap().lookup_error = Some(error);
    }

    /// Make a transaction known to the network
    pub fn add_known_tx(&self, txid: &str) {
        self.state.lock().unwrap().known_txs.insert(
            txid.to_string(),
            ProviderTx {
                txid: txid.to_string(),
                confirmations: 0,
            },
        );
    }

    /// Raw transactions accepted so far
    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl BlockchainProvider for MockProvider {
    async fn get_utxos(
        &self,
        _coin: Coin,
        _network: Network,
        addresses: &[String],
    ) -> std::result::Result<Vec<Utxo>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .utxos
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    async fn estimate_fee(
        &self,
        _coin: Coin,
        _network: Network,
        targets: &[u32],
    ) -> std::result::Result<HashMap<u32, Option<u64>>, ProviderError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fee_error {
            return Err(err.clone());
        }
        Ok(targets
            .iter()
            .map(|t| (*t, state.fee_estimates.get(t).copied().flatten()))
            .collect())
    }

    async fn broadcast(
        &self,
        coin: Coin,
        _network: Network,
        raw_tx: &str,
    ) -> std::result::Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.broadcast_error {
            return Err(err.clone());
        }
        let txid = adapter_for(coin)
            .compute_txid(raw_tx)
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        state.broadcasts.push(raw_tx.to_string());
        state.known_txs.insert(
            txid.clone(),
            ProviderTx {
                txid: txid.clone(),
                confirmations: 0,
            },
        );
        Ok(txid)
    }

    async fn get_transaction(
        &self,
        _coin: Coin,
        _network: Network,
        txid: &str,
    ) -> std::result::Result<Option<ProviderTx>, ProviderError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.lookup_error {
            return Err(err.clone());
        }
        Ok(state.known_txs.get(txid).cloned())
    }

    async fn get_balance(
        &self,
        _coin: Coin,
        _network: Network,
        address: &str,
    ) -> std::result::Result<u64, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state.balances.get(address).copied().unwrap_or_default())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Memory storage whose status transitions can be made to fail
pub struct FaultyStorage {
    inner: Arc<MemoryStorage>,
    failing_transitions: AtomicUsize,
}

impl FaultyStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            failing_transitions: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` status transitions without applying them
    pub fn fail_transitions(&self, count: usize) {
        self.failing_transitions.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn fetch_wallet_policy(
        &self,
        wallet_id: &str,
    ) -> std::result::Result<Option<WalletPolicy>, StorageError> {
        self.inner.fetch_wallet_policy(wallet_id).await
    }

    async fn fetch_wallet_addresses(
        &self,
        wallet_id: &str,
    ) -> std::result::Result<Vec<WalletAddress>, StorageError> {
        self.inner.fetch_wallet_addresses(wallet_id).await
    }

    async fn create_change_address(
        &self,
        wallet_id: &str,
    ) -> std::result::Result<WalletAddress, StorageError> {
        self.inner.create_change_address(wallet_id).await
    }

    async fn fetch_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
    ) -> std::result::Result<Option<TransactionProposal>, StorageError> {
        self.inner.fetch_proposal(wallet_id, proposal_id).await
    }

    async fn fetch_locked_inputs(
        &self,
        wallet_id: &str,
    ) -> std::result::Result<HashSet<String>, StorageError> {
        self.inner.fetch_locked_inputs(wallet_id).await
    }

    async fn fetch_pending_proposals(
        &self,
        wallet_id: &str,
    ) -> std::result::Result<Vec<TransactionProposal>, StorageError> {
        self.inner.fetch_pending_proposals(wallet_id).await
    }

    async fn fetch_recent_proposals(
        &self,
        wallet_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<TransactionProposal>, StorageError> {
        self.inner.fetch_recent_proposals(wallet_id, limit).await
    }

    async fn create_proposal(
        &self,
        proposal: &TransactionProposal,
    ) -> std::result::Result<bool, StorageError> {
        self.inner.create_proposal(proposal).await
    }

    async fn append_action(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        action: ProposalAction,
    ) -> std::result::Result<AppendOutcome, StorageError> {
        self.inner.append_action(wallet_id, proposal_id, action).await
    }

    async fn transition_status(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        patch: StatusPatch,
    ) -> std::result::Result<Option<TransactionProposal>, StorageError> {
        let failing = self
            .failing_transitions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::InvalidData("store unavailable".to_string()));
        }
        self.inner
            .transition_status(wallet_id, proposal_id, from, to, patch)
            .await
    }

    async fn remove_proposal(
        &self,
        wallet_id: &str,
        proposal_id: &str,
        allowed: &[ProposalStatus],
        expected_actions: usize,
    ) -> std::result::Result<bool, StorageError> {
        self.inner
            .remove_proposal(wallet_id, proposal_id, allowed, expected_actions)
            .await
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> std::result::Result<LeaseGrant, StorageError> {
        self.inner.try_acquire_lease(key, token, now, ttl).await
    }

    async fn renew_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> std::result::Result<bool, StorageError> {
        self.inner.renew_lease(key, token, now, ttl).await
    }

    async fn release_lease(&self, key: &str, token: &str) -> std::result::Result<bool, StorageError> {
        self.inner.release_lease(key, token).await
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Keeps every event for later inspection
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ProposalEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ProposalEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: ProposalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// Wallets
// =============================================================================

pub struct TestCopayer {
    pub id: String,
    pub request_key: KeyPair,
    pub signing_key: KeyPair,
}

/// An m-of-n wallet with generated keys and one receive address
pub struct TestWallet {
    pub policy: WalletPolicy,
    pub copayers: Vec<TestCopayer>,
    pub address: WalletAddress,
}

impl TestWallet {
    pub fn new(id: &str, m: u8, n: u8, coin: Coin) -> Self {
        let copayers: Vec<TestCopayer> = (0..n)
            .map(|i| TestCopayer {
                id: format!("copayer-{}", i),
                request_key: KeyPair::generate(),
                signing_key: KeyPair::generate(),
            })
            .collect();
        let registered = copayers
            .iter()
            .map(|c| Copayer {
                id: c.id.clone(),
                name: c.id.clone(),
                request_pub_key: c.request_key.public_key_hex(),
                signing_pub_key: c.signing_key.public_key_hex(),
            })
            .collect();
        let policy = WalletPolicy::new(id, m, n, coin, Network::Livenet, registered).unwrap();

        let path = "m/0/0".to_string();
        let address = match coin {
            Coin::Eth => format!("0x{}", hex::encode(&sha256(id.as_bytes())[..20])),
            _ => multisig_address(m, &policy.signing_keys(), &path, policy.network),
        };

        Self {
            policy,
            copayers,
            address: WalletAddress {
                address,
                path,
                is_change: false,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.policy.id
    }

    pub fn ctx(&self, copayer: usize) -> CopayerContext {
        CopayerContext::new(self.id(), self.copayers[copayer].id.clone())
    }

    /// A fresh output paying the wallet's receive address
    pub fn utxo(&self, satoshis: u64, confirmations: u32) -> Utxo {
        Utxo {
            txid: sha256_hex(&rand::random::<[u8; 16]>()),
            vout: 0,
            address: self.address.address.clone(),
            satoshis,
            confirmations,
            path: self.address.path.clone(),
            public_keys: self.policy.signing_keys(),
        }
    }

    /// Creator signature over the proposal content
    pub fn sign_proposal(&self, copayer: usize, txp: &TransactionProposal) -> String {
        self.copayers[copayer]
            .request_key
            .sign_hex(&txp.signing_hash())
            .unwrap()
    }

    /// One signature per signing slot of the proposal's transaction
    pub fn sign_inputs(&self, copayer: usize, txp: &TransactionProposal) -> Vec<String> {
        let adapter = adapter_for(self.policy.coin);
        let template = adapter.build_unsigned_template(txp).unwrap();
        (0..template.signing_slots())
            .map(|i| {
                let digest = adapter.sighash(&template, i).unwrap();
                self.copayers[copayer]
                    .signing_key
                    .sign_hex(&digest)
                    .unwrap()
            })
            .collect()
    }
}

/// An address outside the wallet
pub fn external_address(coin: Coin) -> String {
    match coin {
        Coin::Eth => format!("0x{}", hex::encode(&rand::random::<[u8; 20]>())),
        _ => KeyPair::generate().address(Network::Livenet),
    }
}

pub fn payment(coin: Coin, amount: u64) -> ProposalOutput {
    ProposalOutput {
        to_address: external_address(coin),
        amount,
        message: None,
    }
}

// =============================================================================
// Harness
// =============================================================================

/// An engine over in-memory storage, a mock provider and a manual clock,
/// with one registered wallet
pub struct Harness {
    pub engine: Arc<ProposalEngine>,
    pub storage: Arc<MemoryStorage>,
    /// What the engine actually talks to: `storage` with fault injection
    pub faults: Arc<FaultyStorage>,
    pub provider: Arc<MockProvider>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub wallet: TestWallet,
}

impl Harness {
    pub fn new(wallet: TestWallet) -> Self {
        Self::with_config(wallet, EngineConfig::default())
    }

    pub fn with_config(wallet: TestWallet, config: EngineConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_wallet(wallet.policy.clone(), vec![wallet.address.clone()])
            .unwrap();
        let faults = Arc::new(FaultyStorage::new(storage.clone()));
        let provider = Arc::new(MockProvider::new());
        let clock = Arc::new(ManualClock::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let engine = ProposalEngine::builder()
            .storage(faults.clone())
            .provider(provider.clone())
            .clock(clock.clone())
            .notifier(notifier.clone())
            .config(config)
            .build()
            .unwrap();

        Self {
            engine: Arc::new(engine),
            storage,
            faults,
            provider,
            clock,
            notifier,
            wallet,
        }
    }

    pub fn fund(&self, satoshis: u64) -> Utxo {
        let utxo = self.wallet.utxo(satoshis, 6);
        self.provider.add_utxo(utxo.clone());
        utxo
    }

    /// Request paying `amount` at a fixed rate, outputs kept in order
    pub fn opts(&self, amount: u64, fee_per_kb: u64) -> CreateTxOpts {
        let mut opts = CreateTxOpts::new(vec![payment(self.wallet.policy.coin, amount)]);
        opts.fee_per_kb = Some(fee_per_kb);
        opts.no_shuffle_outputs = true;
        opts
    }

    pub async fn create(&self, copayer: usize, opts: CreateTxOpts) -> Result<TransactionProposal> {
        self.engine.create_tx(&self.wallet.ctx(copayer), opts).await
    }

    pub async fn publish(
        &self,
        copayer: usize,
        txp: &TransactionProposal,
    ) -> Result<TransactionProposal> {
        let signature = self.wallet.sign_proposal(copayer, txp);
        self.engine
            .publish_tx(&self.wallet.ctx(copayer), &txp.id, &signature)
            .await
    }

    pub async fn create_and_publish(
        &self,
        copayer: usize,
        opts: CreateTxOpts,
    ) -> TransactionProposal {
        let txp = self.create(copayer, opts).await.unwrap();
        self.publish(copayer, &txp).await.unwrap()
    }

    pub async fn sign(
        &self,
        copayer: usize,
        txp: &TransactionProposal,
    ) -> Result<TransactionProposal> {
        let signatures = self.wallet.sign_inputs(copayer, txp);
        self.engine
            .sign_tx(&self.wallet.ctx(copayer), &txp.id, signatures)
            .await
    }

    pub async fn reject(
        &self,
        copayer: usize,
        txp: &TransactionProposal,
    ) -> Result<TransactionProposal> {
        self.engine
            .reject_tx(&self.wallet.ctx(copayer), &txp.id, Some("no".to_string()))
            .await
    }
}
