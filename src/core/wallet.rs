//! Wallet policy
//!
//! Read-only view of a shared M-of-N wallet as supplied by storage: the
//! quorum parameters, coin/network and the registered copayer keys.

use crate::core::error::{Result, TxpError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported coins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coin {
    Btc,
    Bch,
    Eth,
}

impl Coin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coin::Btc => "btc",
            Coin::Bch => "bch",
            Coin::Eth => "eth",
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Coin {
    type Err = TxpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Coin::Btc),
            "bch" => Ok(Coin::Bch),
            "eth" => Ok(Coin::Eth),
            other => Err(TxpError::InvalidParams(format!("unknown coin {}", other))),
        }
    }
}

/// Network a wallet lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Livenet,
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Livenet => f.write_str("livenet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// A registered key holder of a shared wallet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Copayer {
    pub id: String,
    pub name: String,
    /// Key used to sign proposal content at publish time (hex, compressed)
    pub request_pub_key: String,
    /// Key used to sign transaction inputs (hex, compressed)
    pub signing_pub_key: String,
}

/// Quorum and coin parameters of a shared wallet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WalletPolicy {
    pub id: String,
    /// Signatures required to spend (M in M-of-N)
    pub m: u8,
    /// Total number of copayers (N)
    pub n: u8,
    pub coin: Coin,
    pub network: Network,
    /// Wallet receives and returns change on a single address
    #[serde(default)]
    pub single_address: bool,
    #[serde(default)]
    pub copayers: Vec<Copayer>,
}

impl WalletPolicy {
    /// Create a new wallet policy
    ///
    /// # Errors
    /// Returns `InvalidParams` if the quorum is impossible or copayers repeat
    pub fn new(
        id: impl Into<String>,
        m: u8,
        n: u8,
        coin: Coin,
        network: Network,
        copayers: Vec<Copayer>,
    ) -> Result<Self> {
        if m == 0 {
            return Err(TxpError::InvalidParams(
                "m must be at least 1".to_string(),
            ));
        }
        if m > n {
            return Err(TxpError::InvalidParams(format!(
                "m {} exceeds n {}",
                m, n
            )));
        }
        if copayers.len() > n as usize {
            return Err(TxpError::InvalidParams(format!(
                "{} copayers registered for {} seats",
                copayers.len(),
                n
            )));
        }

        let mut ids: Vec<&str> = copayers.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        for i in 1..ids.len() {
            if ids[i] == ids[i - 1] {
                return Err(TxpError::InvalidParams(format!(
                    "duplicate copayer {}",
                    ids[i]
                )));
            }
        }

        Ok(Self {
            id: id.into(),
            m,
            n,
            coin,
            network,
            single_address: false,
            copayers,
        })
    }

    pub fn with_single_address(mut self, single_address: bool) -> Self {
        self.single_address = single_address;
        self
    }

    /// All N copayers have joined
    pub fn is_complete(&self) -> bool {
        self.copayers.len() == self.n as usize
    }

    pub fn copayer(&self, copayer_id: &str) -> Option<&Copayer> {
        self.copayers.iter().find(|c| c.id == copayer_id)
    }

    /// Accept actions needed to reach quorum
    pub fn required_signatures(&self) -> u8 {
        self.m
    }

    /// Reject actions needed to make quorum impossible: `n - m + 1`
    pub fn required_rejections(&self) -> u8 {
        self.n - self.m + 1
    }

    /// Signing keys of every copayer
    pub fn signing_keys(&self) -> Vec<String> {
        self.copayers
            .iter()
            .map(|c| c.signing_pub_key.clone())
            .collect()
    }

    /// Get description like "2-of-3"
    pub fn description(&self) -> String {
        format!("{}-of-{}", self.m, self.n)
    }
}

/// An address derived for a wallet, with its derivation path
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletAddress {
    pub address: String,
    pub path: String,
    #[serde(default)]
    pub is_change: bool,
}
