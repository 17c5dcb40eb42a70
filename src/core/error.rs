//! Error types
//!
//! Every failure surfaced by the engine carries a stable machine-readable
//! code (`TxpError::code`) plus the human-readable `Display` message.

use crate::chain::ChainError;
use crate::provider::ProviderError;
use crate::storage::StorageError;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TxpError>;

/// Errors returned by the proposal engine
#[derive(Error, Debug)]
pub enum TxpError {
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Insufficient funds for fee")]
    InsufficientFundsForFee,
    #[error("Funds are locked by pending transaction proposals")]
    LockedFunds,
    #[error("Some inputs of the proposal are no longer available")]
    UnavailableUtxos,
    #[error("Transaction exceeds the maximum allowed size")]
    TxMaxSizeExceeded,
    #[error("Amount below dust threshold")]
    DustAmount,
    #[error("Cannot create transaction proposal during backoff period ({remaining_secs}s remaining)")]
    TxCannotCreate { remaining_secs: u64 },
    #[error("The transaction proposal is not pending")]
    TxNotPending,
    #[error("The transaction proposal is not accepted")]
    TxNotAccepted,
    #[error("The transaction proposal is already broadcasted")]
    TxAlreadyBroadcasted,
    #[error("Copayer already voted on this transaction proposal")]
    CopayerVoted,
    #[error("Bad signatures")]
    BadSignatures,
    #[error("Cannot remove this transaction proposal")]
    TxCannotRemove,
    #[error("Transaction proposal not found: {0}")]
    TxNotFound(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Wallet is not complete")]
    WalletNotComplete,
    #[error("Copayer not authorized: {0}")]
    NotAuthorized(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Address {0} belongs to a different network")]
    IncorrectAddressNetwork(String),
    #[error("Invalid fee level: {0}")]
    InvalidFeeLevel(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Could not acquire lock for wallet {0}")]
    LockTimeout(String),
    #[error("Blockchain provider error: {0}")]
    Upstream(#[from] ProviderError),
    #[error("Chain adapter failure: {0}")]
    ChainAdapter(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TxpError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TxpError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            TxpError::InsufficientFundsForFee => "INSUFFICIENT_FUNDS_FOR_FEE",
            TxpError::LockedFunds => "LOCKED_FUNDS",
            TxpError::UnavailableUtxos => "UNAVAILABLE_UTXOS",
            TxpError::TxMaxSizeExceeded => "TX_MAX_SIZE_EXCEEDED",
            TxpError::DustAmount => "DUST_AMOUNT",
            TxpError::TxCannotCreate { .. } => "TX_CANNOT_CREATE",
            TxpError::TxNotPending => "TX_NOT_PENDING",
            TxpError::TxNotAccepted => "TX_NOT_ACCEPTED",
            TxpError::TxAlreadyBroadcasted => "TX_ALREADY_BROADCASTED",
            TxpError::CopayerVoted => "COPAYER_VOTED",
            TxpError::BadSignatures => "BAD_SIGNATURES",
            TxpError::TxCannotRemove => "TX_CANNOT_REMOVE",
            TxpError::TxNotFound(_) => "TX_NOT_FOUND",
            TxpError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            TxpError::WalletNotComplete => "WALLET_NOT_COMPLETE",
            TxpError::NotAuthorized(_) => "NOT_AUTHORIZED",
            TxpError::InvalidAddress(_) => "INVALID_ADDRESS",
            TxpError::IncorrectAddressNetwork(_) => "INCORRECT_ADDRESS_NETWORK",
            TxpError::InvalidFeeLevel(_) => "INVALID_FEE_LEVEL",
            TxpError::InvalidParams(_) => "INVALID_PARAMS",
            TxpError::LockTimeout(_) => "LOCK_TIMEOUT",
            TxpError::Upstream(_) => "UPSTREAM_ERROR",
            TxpError::ChainAdapter(_) => "CHAIN_ADAPTER_ERROR",
            TxpError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the same request may succeed later without being changed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxpError::LockedFunds
                | TxpError::UnavailableUtxos
                | TxpError::TxCannotCreate { .. }
                | TxpError::LockTimeout(_)
                | TxpError::Upstream(_)
        )
    }
}

impl From<ChainError> for TxpError {
    fn from(err: ChainError) -> Self {
        TxpError::ChainAdapter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TxpError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            TxpError::TxCannotCreate { remaining_secs: 5 }.code(),
            "TX_CANNOT_CREATE"
        );
        assert_eq!(
            TxpError::Upstream(ProviderError::Unavailable("down".into())).code(),
            "UPSTREAM_ERROR"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TxpError::LockedFunds.is_retryable());
        assert!(TxpError::UnavailableUtxos.is_retryable());
        assert!(TxpError::TxCannotCreate { remaining_secs: 1 }.is_retryable());
        assert!(!TxpError::DustAmount.is_retryable());
        assert!(!TxpError::BadSignatures.is_retryable());
        assert!(!TxpError::InvalidParams("x".into()).is_retryable());
    }

    #[test]
    fn test_chain_errors_are_normalized() {
        let err: TxpError = ChainError::Encoding("bad varint".into()).into();
        assert_eq!(err.code(), "CHAIN_ADAPTER_ERROR");
    }
}
