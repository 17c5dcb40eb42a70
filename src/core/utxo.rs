//! Unspent transaction outputs
//!
//! UTXOs come from the blockchain data provider and are never owned or
//! mutated here, only provisionally reserved by proposals.

use serde::{Deserialize, Serialize};

/// Unspent Transaction Output (UTXO)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub satoshis: u64,
    #[serde(default)]
    pub confirmations: u32,
    /// Derivation path of `address` within the wallet
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub public_keys: Vec<String>,
}

impl Utxo {
    /// Outpoint key `txid:vout`
    pub fn outpoint(&self) -> String {
        outpoint(&self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

pub fn outpoint(txid: &str, vout: u32) -> String {
    format!("{}:{}", txid, vout)
}

/// Sum of satoshis across UTXOs
pub fn total_satoshis<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> u64 {
    utxos.into_iter().map(|u| u.satoshis).sum()
}
