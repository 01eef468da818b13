//! Error types for the transaction coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("There is another contract with alias [{0}]")]
    DuplicateAlias(String),

    #[error("Another contract is already registered on address {0}")]
    DuplicateAddress(String),

    #[error("Timed out after {waited_ms}ms waiting for the lock on {address}")]
    LockTimeout { address: String, waited_ms: u64 },

    #[error("Cannot calculate gas: {0}")]
    GasEstimation(String),

    #[error("Cannot sign transaction with given account: {0}")]
    Signing(String),

    #[error("Cannot send transaction to the network: {0}")]
    Broadcast(String),

    #[error("Transaction was declined")]
    Declined,

    #[error("Transaction could not be confirmed after {minutes} minutes")]
    ConfirmationTimeout { minutes: u64 },

    #[error("Transaction confirmation rejected: {0}")]
    ConfirmationRejected(String),

    #[error("Forbidden {0}")]
    Forbidden(String),

    #[error("Shared store error: {0}")]
    Store(String),

    #[error("RPC error calling {method}: {message}")]
    Rpc { method: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Stable code reported to callbacks alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidInput(_) => "invalidInput",
            CoordinatorError::NotFound(_) => "notFound",
            CoordinatorError::DuplicateAlias(_) => "duplicateAlias",
            CoordinatorError::DuplicateAddress(_) => "duplicateAddress",
            CoordinatorError::LockTimeout { .. } => "lockTimeout",
            CoordinatorError::GasEstimation(_) => "gasEstimationFail",
            CoordinatorError::Signing(_) => "invalidAccount",
            CoordinatorError::Broadcast(_) => "invalidNetwork",
            CoordinatorError::Declined => "txDeclined",
            CoordinatorError::ConfirmationTimeout { .. } => "timeout",
            CoordinatorError::ConfirmationRejected(_) => "rejected",
            CoordinatorError::Forbidden(_) => "forbidden",
            CoordinatorError::Store(_) => "storeError",
            CoordinatorError::Rpc { .. } => "rpcError",
            CoordinatorError::Database(_) => "databaseError",
            CoordinatorError::Config(_) => "configError",
            CoordinatorError::Internal(_) => "internalError",
        }
    }

    /// True when the failure happened before anything reached the network,
    /// so the assigned nonce was never consumed.
    pub fn is_pre_broadcast(&self) -> bool {
        !matches!(
            self,
            CoordinatorError::ConfirmationTimeout { .. }
                | CoordinatorError::ConfirmationRejected(_)
        )
    }

    /// Check if the caller may reasonably retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::LockTimeout { .. }
                | CoordinatorError::GasEstimation(_)
                | CoordinatorError::Broadcast(_)
                | CoordinatorError::Store(_)
                | CoordinatorError::Rpc { .. }
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_callback_contract() {
        assert_eq!(
            CoordinatorError::GasEstimation("boom".into()).code(),
            "gasEstimationFail"
        );
        assert_eq!(CoordinatorError::Declined.code(), "txDeclined");
        assert_eq!(
            CoordinatorError::Forbidden("eth_accounts".into()).to_string(),
            "Forbidden eth_accounts"
        );
    }

    #[test]
    fn test_pre_broadcast_classification() {
        assert!(CoordinatorError::Signing("bad key".into()).is_pre_broadcast());
        assert!(CoordinatorError::Declined.is_pre_broadcast());
        assert!(!CoordinatorError::ConfirmationTimeout { minutes: 30 }.is_pre_broadcast());
    }
}
