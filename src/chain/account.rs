//! Account-based coins
//!
//! A transfer debits the wallet's account: there are no inputs to select and
//! no change. The fee is the gas price times a fixed transfer gas limit; the
//! configured "fee per kb" of a level is read as the gas price.

use super::encoding::TxWriter;
use super::{
    check_signature_shape, ChainAdapter, ChainError, CoinCapabilities, CoinFamily,
    TemplateOutput, TxTemplate,
};
use crate::core::{Coin, Network, Result, TransactionProposal, TxpError};
use crate::crypto::sha256;

/// Gas consumed by a plain value transfer
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;
pub const MAX_GAS_PRICE: u64 = 1_000_000_000_000;

const TRANSFER_SIZE: usize = 110;

/// Adapter for eth
pub struct AccountChainAdapter {
    capabilities: CoinCapabilities,
}

impl AccountChainAdapter {
    pub fn new() -> Self {
        Self {
            capabilities: CoinCapabilities {
                family: CoinFamily::Account,
                supports_change: false,
                dust_threshold: 0,
                max_tx_size: usize::MAX,
                min_fee_per_kb: 1,
                max_fee_per_kb: MAX_GAS_PRICE,
            },
        }
    }

    fn is_account_address(address: &str) -> bool {
        address
            .strip_prefix("0x")
            .map(|body| body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()))
            .unwrap_or(false)
    }

    fn serialize(
        template: &TxTemplate,
        signatures: &[Vec<String>],
    ) -> std::result::Result<Vec<u8>, ChainError> {
        let from = template
            .from_address
            .as_deref()
            .ok_or_else(|| ChainError::Encoding("missing sending account".to_string()))?;
        let output = template
            .outputs
            .first()
            .ok_or_else(|| ChainError::Encoding("missing recipient".to_string()))?;

        let mut w = TxWriter::new();
        w.hex(strip_0x(from))?
            .hex(strip_0x(&output.address))?
            .u64(output.amount)
            .u64(template.fee)
            .u64(TRANSFER_GAS_LIMIT)
            .varint(signatures.len() as u64);
        for signer in signatures {
            for sig in signer {
                w.hex(sig)?;
            }
        }
        Ok(w.into_bytes())
    }
}

fn strip_0x(address: &str) -> &str {
    address.strip_prefix("0x").unwrap_or(address)
}

impl Default for AccountChainAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainAdapter for AccountChainAdapter {
    fn capabilities(&self) -> &CoinCapabilities {
        &self.capabilities
    }

    /// Account addresses carry no network marker
    fn validate_address(&self, address: &str, _network: Network) -> Result<()> {
        if Self::is_account_address(address) {
            Ok(())
        } else {
            Err(TxpError::InvalidAddress(address.to_string()))
        }
    }

    fn estimate_size(&self, _n_inputs: usize, _n_outputs: usize, _m: u8, _n: u8) -> usize {
        TRANSFER_SIZE
    }

    fn fee_for(&self, gas_price: u64, _n_inputs: usize, _n_outputs: usize, _m: u8, _n: u8) -> u64 {
        gas_price.saturating_mul(TRANSFER_GAS_LIMIT)
    }

    fn build_unsigned_template(
        &self,
        proposal: &TransactionProposal,
    ) -> std::result::Result<TxTemplate, ChainError> {
        if proposal.outputs.len() != 1 {
            return Err(ChainError::Unsupported(
                "account transfers carry exactly one output".to_string(),
            ));
        }
        let from = proposal
            .from_address
            .clone()
            .filter(|a| Self::is_account_address(a))
            .ok_or_else(|| ChainError::Encoding("missing sending account".to_string()))?;
        let output = &proposal.outputs[0];
        if !Self::is_account_address(&output.to_address) {
            return Err(ChainError::Encoding(format!(
                "bad recipient {}",
                output.to_address
            )));
        }

        Ok(TxTemplate {
            coin: Coin::Eth,
            inputs: Vec::new(),
            outputs: vec![TemplateOutput {
                address: output.to_address.clone(),
                amount: output.amount,
            }],
            fee: proposal.fee,
            from_address: Some(from),
        })
    }

    fn sighash(
        &self,
        template: &TxTemplate,
        index: usize,
    ) -> std::result::Result<Vec<u8>, ChainError> {
        if index != 0 {
            return Err(ChainError::SlotOutOfRange(index));
        }
        Ok(sha256(&Self::serialize(template, &[])?))
    }

    fn apply_signatures(
        &self,
        template: &TxTemplate,
        signatures: &[Vec<String>],
    ) -> std::result::Result<String, ChainError> {
        check_signature_shape(template, signatures)?;
        Ok(hex::encode(Self::serialize(template, signatures)?))
    }

    fn compute_txid(&self, raw_tx: &str) -> std::result::Result<String, ChainError> {
        let bytes = hex::decode(raw_tx).map_err(|e| ChainError::Encoding(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(sha256(&bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FROM: &str = "0x1111111111111111111111111111111111111111";
    const TO: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_address_validation() {
        let adapter = AccountChainAdapter::new();
        assert!(adapter.validate_address(TO, Network::Livenet).is_ok());
        assert!(adapter.validate_address("0x1234", Network::Livenet).is_err());
        assert!(adapter
            .validate_address("2222222222222222222222222222222222222222", Network::Livenet)
            .is_err());
    }

    #[test]
    fn test_fee_is_gas_price_times_limit() {
        let adapter = AccountChainAdapter::new();
        assert_eq!(adapter.fee_for(1_000_000_000, 0, 1, 2, 3), 21_000_000_000_000);
    }

    #[test]
    fn test_single_signature_slot() {
        let adapter = AccountChainAdapter::new();
        let template = TxTemplate {
            coin: Coin::Eth,
            inputs: vec![],
            outputs: vec![TemplateOutput {
                address: TO.to_string(),
                amount: 5,
            }],
            fee: 21_000,
            from_address: Some(FROM.to_string()),
        };
        assert!(adapter.sighash(&template, 0).is_ok());
        assert!(adapter.sighash(&template, 1).is_err());

        let raw = adapter
            .apply_signatures(&template, &[vec!["abcd".to_string()]])
            .unwrap();
        assert!(adapter.compute_txid(&raw).unwrap().starts_with("0x"));
    }
}
