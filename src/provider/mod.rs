//! Blockchain data provider
//!
//! Read access to unspent outputs, fee estimates and transaction lookup,
//! plus transaction submission. Implementations talk to a node or an
//! indexer; the engine only sees this trait.

use crate::core::{Coin, Network, Utxo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Provider failures, surfaced verbatim to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

/// A transaction known to the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTx {
    pub txid: String,
    #[serde(default)]
    pub confirmations: u32,
}

#[async_trait]
pub trait BlockchainProvider: Send + Sync {
    /// Unspent outputs paying to any of `addresses`
    async fn get_utxos(
        &self,
        coin: Coin,
        network: Network,
        addresses: &[String],
    ) -> Result<Vec<Utxo>, ProviderError>;

    /// Fee per kB for each confirmation target; `None` where the provider
    /// has no estimate
    async fn estimate_fee(
        &self,
        coin: Coin,
        network: Network,
        targets: &[u32],
    ) -> Result<HashMap<u32, Option<u64>>, ProviderError>;

    /// Submit a raw transaction, returning the network txid
    async fn broadcast(
        &self,
        coin: Coin,
        network: Network,
        raw_tx: &str,
    ) -> Result<String, ProviderError>;

    async fn get_transaction(
        &self,
        coin: Coin,
        network: Network,
        txid: &str,
    ) -> Result<Option<ProviderTx>, ProviderError>;

    /// Balance of an account address. UTXO providers derive it from the
    /// unspent outputs.
    async fn get_balance(
        &self,
        coin: Coin,
        network: Network,
        address: &str,
    ) -> Result<u64, ProviderError> {
        let utxos = self
            .get_utxos(coin, network, &[address.to_string()])
            .await?;
        Ok(utxos.iter().map(|u| u.satoshis).sum())
    }
}
