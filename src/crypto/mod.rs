//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / HASH160 digests
//! - ECDSA key management and signature checks (secp256k1)
//! - Base58Check address encoding and validation

pub mod address;
pub mod hash;
pub mod keys;

pub use address::{decode_address, multisig_address, p2pkh_address, AddressKind, DecodedAddress};
pub use hash::{double_sha256, double_sha256_hex, hash160, sha256, sha256_hex};
pub use keys::{
    public_key_from_hex, sign_message, verify_hex_signature, verify_signature, KeyError, KeyPair,
};
