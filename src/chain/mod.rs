//! Chain adapters
//!
//! Per-coin-family behavior behind one capability interface:
//! - `utxo` serves coins that spend inputs and return change (btc, bch)
//! - `account` serves balance-based coins with a single transfer (eth)
//!
//! The selector and the proposal builder are parameterized by
//! `CoinCapabilities` instead of branching on coin names.

pub mod account;
mod encoding;
pub mod utxo;

pub use account::AccountChainAdapter;
pub use utxo::UtxoChainAdapter;

use crate::core::fee::FeeRate;
use crate::core::{Coin, Network, Result, TransactionProposal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Chain adapter failures
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Inputs {inputs} do not cover outputs {outputs} plus fee {fee}")]
    Unbalanced { inputs: u64, outputs: u64, fee: u64 },
    #[error("Expected {expected} signatures, got {actual}")]
    SignatureCount { expected: usize, actual: usize },
    #[error("Signature slot {0} out of range")]
    SlotOutOfRange(usize),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// How a coin family moves value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
    /// Spends unspent outputs, may return change
    Utxo,
    /// Debits an account balance, no inputs or change
    Account,
}

/// What the proposal builder and selector may do for a coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinCapabilities {
    pub family: CoinFamily,
    pub supports_change: bool,
    /// Smallest output or change worth creating
    pub dust_threshold: u64,
    /// Size ceiling of a transaction in bytes
    pub max_tx_size: usize,
    pub min_fee_per_kb: u64,
    pub max_fee_per_kb: u64,
}

/// An input of an unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub satoshis: u64,
}

/// An output of an unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOutput {
    pub address: String,
    pub amount: u64,
}

/// Unsigned transaction built from a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxTemplate {
    pub coin: Coin,
    pub inputs: Vec<TemplateInput>,
    pub outputs: Vec<TemplateOutput>,
    pub fee: u64,
    /// Sending account for account-based coins
    pub from_address: Option<String>,
}

impl TxTemplate {
    /// Number of signatures each copayer contributes: one per input, or a
    /// single one for input-less transfers
    pub fn signing_slots(&self) -> usize {
        self.inputs.len().max(1)
    }
}

/// Per-coin transaction construction and signature handling
pub trait ChainAdapter: Send + Sync {
    fn capabilities(&self) -> &CoinCapabilities;

    /// Validate an address for the wallet's network.
    ///
    /// # Errors
    /// `InvalidAddress` for malformed addresses, `IncorrectAddressNetwork`
    /// for well-formed addresses of another network
    fn validate_address(&self, address: &str, network: Network) -> Result<()>;

    /// Estimated serialized size of a fully signed m-of-n transaction
    fn estimate_size(&self, n_inputs: usize, n_outputs: usize, m: u8, n: u8) -> usize;

    /// Fee for a transaction of the given shape at `fee_per_kb`
    fn fee_for(&self, fee_per_kb: u64, n_inputs: usize, n_outputs: usize, m: u8, n: u8) -> u64 {
        FeeRate::from_sat_per_kb(fee_per_kb).fee_for_size(self.estimate_size(
            n_inputs, n_outputs, m, n,
        ))
    }

    fn build_unsigned_template(
        &self,
        proposal: &TransactionProposal,
    ) -> std::result::Result<TxTemplate, ChainError>;

    fn estimate_template_size(&self, template: &TxTemplate, m: u8, n: u8) -> usize {
        self.estimate_size(template.inputs.len(), template.outputs.len(), m, n)
    }

    /// Digest a copayer signs for signing slot `index`
    fn sighash(&self, template: &TxTemplate, index: usize)
        -> std::result::Result<Vec<u8>, ChainError>;

    /// Assemble the raw transaction (hex) from each signer's per-slot
    /// signatures, in signing order
    fn apply_signatures(
        &self,
        template: &TxTemplate,
        signatures: &[Vec<String>],
    ) -> std::result::Result<String, ChainError>;

    fn compute_txid(&self, raw_tx: &str) -> std::result::Result<String, ChainError>;
}

/// Adapter serving a coin
pub fn adapter_for(coin: Coin) -> Arc<dyn ChainAdapter> {
    match coin {
        Coin::Btc | Coin::Bch => Arc::new(UtxoChainAdapter::new(coin)),
        Coin::Eth => Arc::new(AccountChainAdapter::new()),
    }
}

/// Signatures must be supplied for every slot by every signer
fn check_signature_shape(
    template: &TxTemplate,
    signatures: &[Vec<String>],
) -> std::result::Result<(), ChainError> {
    let expected = template.signing_slots();
    for signer in signatures {
        if signer.len() != expected {
            return Err(ChainError::SignatureCount {
                expected,
                actual: signer.len(),
            });
        }
    }
    Ok(())
}
