//! ECDSA key management
//!
//! Copayer request keys sign proposal content at publish time, copayer
//! signing keys sign per-input signature hashes. Both use secp256k1.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::address::p2pkh_address;
use super::hash::sha256;
use crate::core::Network;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Pay-to-pubkey-hash address of this key on `network`
    pub fn address(&self, network: Network) -> String {
        p2pkh_address(&self.public_key.serialize(), network)
    }

    /// Sign a message hash, returning the compact signature as hex
    pub fn sign_hex(&self, message_hash: &[u8]) -> Result<String, KeyError> {
        Ok(hex::encode(sign_message(&self.secret_key, message_hash)?))
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message_hash: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_signature(&self.public_key, message_hash, signature)
    }
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

fn digest32(message_hash: &[u8]) -> Vec<u8> {
    if message_hash.len() == 32 {
        message_hash.to_vec()
    } else {
        sha256(message_hash)
    }
}

/// Sign a message hash with a secret key
pub fn sign_message(secret_key: &SecretKey, message_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&digest32(message_hash))?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a signature against a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message_hash: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&digest32(message_hash))?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

/// Verify a hex signature against a hex public key.
///
/// Malformed keys or signatures verify as `false` rather than erroring.
pub fn verify_hex_signature(public_key_hex: &str, message_hash: &[u8], signature_hex: &str) -> bool {
    let Ok(public_key) = public_key_from_hex(public_key_hex) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    verify_signature(&public_key, message_hash, &signature).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let message_hash = sha256(b"proposal content");

        let signature = sign_message(&kp.secret_key, &message_hash).unwrap();
        assert!(kp.verify(&message_hash, &signature).unwrap());
        assert!(!kp.verify(&sha256(b"tampered"), &signature).unwrap());
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let private_hex = hex::encode(kp1.secret_key.secret_bytes());

        let kp2 = KeyPair::from_private_key_hex(&private_hex).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.address(Network::Livenet), kp2.address(Network::Livenet));
    }

    #[test]
    fn test_verify_hex_signature() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let hash = sha256(b"sighash");
        let sig = kp.sign_hex(&hash).unwrap();

        assert!(verify_hex_signature(&kp.public_key_hex(), &hash, &sig));
        assert!(!verify_hex_signature(&other.public_key_hex(), &hash, &sig));
        assert!(!verify_hex_signature("zz", &hash, &sig));
        assert!(!verify_hex_signature(&kp.public_key_hex(), &hash, "not-hex"));
    }
}
