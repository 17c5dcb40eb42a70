//! UTXO-based coins
//!
//! Pay-to-script-hash multisig spending: every input carries one signature
//! per required signer, so input size grows with both m and n.

use super::encoding::TxWriter;
use super::{
    check_signature_shape, ChainAdapter, ChainError, CoinCapabilities, CoinFamily, TemplateInput,
    TemplateOutput, TxTemplate,
};
use crate::core::{Coin, Network, Result, TransactionProposal, TxpError};
use crate::crypto::{decode_address, double_sha256, AddressKind};

pub const DUST_THRESHOLD: u64 = 546;
pub const MAX_TX_SIZE: usize = 100 * 1024;
pub const MAX_FEE_PER_KB: u64 = 1_000_000;

const TX_VERSION: u32 = 1;
const SEQUENCE_FINAL: u32 = 0xffff_ffff;

// Size model
const TX_OVERHEAD: usize = 10;
const INPUT_OVERHEAD: usize = 49;
const SIGNATURE_SIZE: usize = 73;
const PUBKEY_SIZE: usize = 34;
const OUTPUT_SIZE: usize = 34;

/// Adapter for btc and bch
pub struct UtxoChainAdapter {
    coin: Coin,
    capabilities: CoinCapabilities,
}

impl UtxoChainAdapter {
    pub fn new(coin: Coin) -> Self {
        Self {
            coin,
            capabilities: CoinCapabilities {
                family: CoinFamily::Utxo,
                supports_change: true,
                dust_threshold: DUST_THRESHOLD,
                max_tx_size: MAX_TX_SIZE,
                min_fee_per_kb: 0,
                max_fee_per_kb: MAX_FEE_PER_KB,
            },
        }
    }

    fn output_script(address: &str) -> std::result::Result<Vec<u8>, ChainError> {
        let decoded = decode_address(address)
            .ok_or_else(|| ChainError::Encoding(format!("bad address {}", address)))?;
        let mut script = vec![match decoded.kind {
            AddressKind::PubKeyHash => 0x76,
            AddressKind::ScriptHash => 0xa9,
        }];
        script.extend_from_slice(&decoded.hash);
        Ok(script)
    }

    /// Serialize with optional per-input signature scripts
    fn serialize(
        &self,
        template: &TxTemplate,
        scripts: Option<&[Vec<Vec<u8>>]>,
    ) -> std::result::Result<Vec<u8>, ChainError> {
        let mut w = TxWriter::new();
        w.u32(TX_VERSION).varint(template.inputs.len() as u64);

        for (i, input) in template.inputs.iter().enumerate() {
            w.hex(&input.txid)?.u32(input.vout);
            match scripts.and_then(|s| s.get(i)) {
                Some(sigs) => {
                    w.varint(sigs.len() as u64);
                    for sig in sigs {
                        w.bytes(sig);
                    }
                }
                None => {
                    w.varint(0);
                }
            }
            w.u32(SEQUENCE_FINAL);
        }

        w.varint(template.outputs.len() as u64);
        for output in &template.outputs {
            w.u64(output.amount).bytes(&Self::output_script(&output.address)?);
        }

        w.u32(0);
        Ok(w.into_bytes())
    }
}

impl ChainAdapter for UtxoChainAdapter {
    fn capabilities(&self) -> &CoinCapabilities {
        &self.capabilities
    }

    fn validate_address(&self, address: &str, network: Network) -> Result<()> {
        let decoded =
            decode_address(address).ok_or_else(|| TxpError::InvalidAddress(address.to_string()))?;
        if decoded.network != network {
            return Err(TxpError::IncorrectAddressNetwork(address.to_string()));
        }
        Ok(())
    }

    fn estimate_size(&self, n_inputs: usize, n_outputs: usize, m: u8, n: u8) -> usize {
        let input_size =
            INPUT_OVERHEAD + SIGNATURE_SIZE * m as usize + PUBKEY_SIZE * n as usize;
        TX_OVERHEAD + n_inputs * input_size + n_outputs * OUTPUT_SIZE
    }

    fn build_unsigned_template(
        &self,
        proposal: &TransactionProposal,
    ) -> std::result::Result<TxTemplate, ChainError> {
        let inputs: Vec<TemplateInput> = proposal
            .inputs
            .iter()
            .map(|i| TemplateInput {
                txid: i.txid.clone(),
                vout: i.vout,
                address: i.address.clone(),
                satoshis: i.satoshis,
            })
            .collect();
        let outputs: Vec<TemplateOutput> = proposal.ordered_outputs();

        let input_total: u64 = inputs.iter().map(|i| i.satoshis).sum();
        let output_total: u64 = outputs.iter().map(|o| o.amount).sum();
        if inputs.is_empty() || input_total != output_total + proposal.fee {
            return Err(ChainError::Unbalanced {
                inputs: input_total,
                outputs: output_total,
                fee: proposal.fee,
            });
        }

        Ok(TxTemplate {
            coin: self.coin,
            inputs,
            outputs,
            fee: proposal.fee,
            from_address: None,
        })
    }

    fn sighash(
        &self,
        template: &TxTemplate,
        index: usize,
    ) -> std::result::Result<Vec<u8>, ChainError> {
        if index >= template.inputs.len() {
            return Err(ChainError::SlotOutOfRange(index));
        }
        let mut data = self.serialize(template, None)?;
        data.extend_from_slice(&(index as u32).to_le_bytes());
        Ok(double_sha256(&data))
    }

    fn apply_signatures(
        &self,
        template: &TxTemplate,
        signatures: &[Vec<String>],
    ) -> std::result::Result<String, ChainError> {
        check_signature_shape(template, signatures)?;

        let mut scripts: Vec<Vec<Vec<u8>>> = vec![Vec::new(); template.inputs.len()];
        for signer in signatures {
            for (i, sig) in signer.iter().enumerate() {
                let bytes = hex::decode(sig)
                    .map_err(|e| ChainError::Encoding(format!("signature: {}", e)))?;
                scripts[i].push(bytes);
            }
        }

        Ok(hex::encode(self.serialize(template, Some(&scripts))?))
    }

    fn compute_txid(&self, raw_tx: &str) -> std::result::Result<String, ChainError> {
        let bytes = hex::decode(raw_tx).map_err(|e| ChainError::Encoding(e.to_string()))?;
        let mut hash = double_sha256(&bytes);
        hash.reverse();
        Ok(hex::encode(hash))
    }
}
