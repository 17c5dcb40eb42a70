//! Base58Check addresses
//!
//! Address = Base58Check(version || HASH160(payload)). Version bytes select
//! the network and the script kind (pay-to-pubkey-hash or pay-to-script-hash).

use super::hash::{double_sha256, hash160};
use crate::core::Network;
use sha2::{Digest, Sha256};

const P2PKH_LIVENET: u8 = 0x00;
const P2SH_LIVENET: u8 = 0x05;
const P2PKH_TESTNET: u8 = 0x6f;
const P2SH_TESTNET: u8 = 0xc4;

/// Script kind encoded in an address version byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    PubKeyHash,
    ScriptHash,
}

/// Result of decoding a Base58Check address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAddress {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: Vec<u8>,
}

fn version_byte(network: Network, kind: AddressKind) -> u8 {
    match (network, kind) {
        (Network::Livenet, AddressKind::PubKeyHash) => P2PKH_LIVENET,
        (Network::Livenet, AddressKind::ScriptHash) => P2SH_LIVENET,
        (Network::Testnet, AddressKind::PubKeyHash) => P2PKH_TESTNET,
        (Network::Testnet, AddressKind::ScriptHash) => P2SH_TESTNET,
    }
}

fn encode_check(version: u8, hash: &[u8]) -> String {
    let mut address_bytes = vec![version];
    address_bytes.extend_from_slice(hash);

    let checksum = {
        let first_hash = Sha256::digest(&address_bytes);
        let second_hash = Sha256::digest(first_hash);
        second_hash[..4].to_vec()
    };
    address_bytes.extend_from_slice(&checksum);

    bs58::encode(address_bytes).into_string()
}

/// Pay-to-pubkey-hash address for a serialized public key
pub fn p2pkh_address(public_key: &[u8], network: Network) -> String {
    encode_check(
        version_byte(network, AddressKind::PubKeyHash),
        &hash160(public_key),
    )
}

/// Pay-to-script-hash address for an m-of-n key set at a derivation path.
///
/// Keys are sorted so the address does not depend on copayer join order.
pub fn multisig_address(m: u8, public_keys: &[String], path: &str, network: Network) -> String {
    let mut sorted_keys = public_keys.to_vec();
    sorted_keys.sort();

    let mut script_data = vec![m];
    for pubkey in &sorted_keys {
        script_data.extend_from_slice(pubkey.as_bytes());
    }
    script_data.extend_from_slice(path.as_bytes());

    encode_check(
        version_byte(network, AddressKind::ScriptHash),
        &hash160(&script_data),
    )
}

/// Decode and checksum-verify an address. Returns `None` for anything that
/// is not a well-formed address of a known version.
pub fn decode_address(address: &str) -> Option<DecodedAddress> {
    let bytes = bs58::decode(address).into_vec().ok()?;
    if bytes.len() != 25 {
        return None;
    }

    let (body, checksum) = bytes.split_at(21);
    if double_sha256(body)[..4] != *checksum {
        return None;
    }

    let (network, kind) = match body[0] {
        P2PKH_LIVENET => (Network::Livenet, AddressKind::PubKeyHash),
        P2SH_LIVENET => (Network::Livenet, AddressKind::ScriptHash),
        P2PKH_TESTNET => (Network::Testnet, AddressKind::PubKeyHash),
        P2SH_TESTNET => (Network::Testnet, AddressKind::ScriptHash),
        _ => return None,
    };

    Some(DecodedAddress {
        network,
        kind,
        hash: body[1..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_p2pkh_round_trip() {
        let kp = KeyPair::generate();
        let address = kp.address(Network::Livenet);
        assert!(address.starts_with('1'));

        let decoded = decode_address(&address).unwrap();
        assert_eq!(decoded.network, Network::Livenet);
        assert_eq!(decoded.kind, AddressKind::PubKeyHash);
    }

    #[test]
    fn test_multisig_address_is_order_independent() {
        let keys: Vec<String> = (0..3).map(|_| KeyPair::generate().public_key_hex()).collect();
        let mut reversed = keys.clone();
        reversed.reverse();

        let a = multisig_address(2, &keys, "m/0/0", Network::Livenet);
        let b = multisig_address(2, &reversed, "m/0/0", Network::Livenet);
        assert_eq!(a, b);
        assert!(a.starts_with('3'));
        assert_ne!(a, multisig_address(2, &keys, "m/1/0", Network::Livenet));
    }

    #[test]
    fn test_testnet_versions() {
        let keys = vec![KeyPair::generate().public_key_hex()];
        let address = multisig_address(1, &keys, "m/0/0", Network::Testnet);
        let decoded = decode_address(&address).unwrap();
        assert_eq!(decoded.network, Network::Testnet);
        assert_eq!(decoded.kind, AddressKind::ScriptHash);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let kp = KeyPair::generate();
        let mut address = kp.address(Network::Livenet);
        let last = address.pop().unwrap();
        address.push(if last == 'a' { 'b' } else { 'a' });

        assert!(decode_address(&address).is_none());
        assert!(decode_address("not-an-address").is_none());
        assert!(decode_address("").is_none());
    }
}
