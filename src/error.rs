//! # Error Types for the Channel Engine
//!
//! Every fallible operation in the library returns an [`EngineError`]. Failures
//! are surfaced as typed results; nothing is retried internally and no failure is
//! signalled through an empty or default value.

use thiserror::Error;

/// Main error type for selection, script construction, signing and delegation
#[derive(Debug, Error)]
pub enum EngineError {
    /// Native-coin selection or change computation went negative
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    /// Asset selection or change computation went negative
    #[error("Insufficient {asset}: required {required}, available {available}")]
    InsufficientAsset {
        asset: String,
        required: u64,
        available: u64,
    },

    /// A specific unspent output (or other lookup target) does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Compiled redeem script exceeds the P2SH push ceiling
    #[error("Script too large: {size} bytes exceeds the {max}-byte limit")]
    ScriptTooLarge { size: usize, max: usize },

    /// Locktime ordering, range or mode violation
    #[error("Invalid locktime: {message}")]
    InvalidLocktime { message: String },

    /// Public key with the wrong encoding or length
    #[error("Invalid public key: {message}")]
    InvalidKey { message: String },

    /// Template parameters that cannot describe a valid script
    #[error("Invalid script template: {message}")]
    InvalidTemplate { message: String },

    /// Payment amount or asset name that cannot be encoded into an output
    #[error("Invalid payment: {message}")]
    InvalidPayment { message: String },

    /// Memo payload outside the accepted length window
    #[error("Invalid memo: {length} bytes, expected {min}..={max}")]
    InvalidMemo { length: usize, min: usize, max: usize },

    /// Address parsing and validation errors
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Completer-side amount or destination check failed
    #[error("Fee mismatch: {message}")]
    FeeMismatch { message: String },

    /// Completer-side structural or signature check failed
    #[error("Unverified envelope: {message}")]
    Unverified { message: String },

    /// Envelope failed schema validation before any semantic check
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    /// Unlocking script does not satisfy the locking script
    #[error("Script verification failed for input {input}: {reason}")]
    ScriptVerificationFailed { input: usize, reason: String },

    /// Signature hash computation or signing failure
    #[error("Signing failed: {message}")]
    Signing { message: String },

    /// Transaction or script (de)serialization failure
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Broadcast or lookup failure
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: NetworkError,
    },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn locktime(message: impl Into<String>) -> Self {
        Self::InvalidLocktime {
            message: message.into(),
        }
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            message: message.into(),
        }
    }

    pub fn payment(message: impl Into<String>) -> Self {
        Self::InvalidPayment {
            message: message.into(),
        }
    }

    pub fn fee_mismatch(message: impl Into<String>) -> Self {
        Self::FeeMismatch {
            message: message.into(),
        }
    }

    pub fn unverified(message: impl Into<String>) -> Self {
        Self::Unverified {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
        }
    }

    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing {
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Check if this error is retryable (network/temporary issues).
    ///
    /// The engine itself never retries; this only informs the caller's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Network { .. })
    }

    /// Errors raised while checking a fee-delegation envelope. The envelope must
    /// be discarded unbroadcast when one of these occurs.
    pub fn is_delegation_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::FeeMismatch { .. }
                | EngineError::Unverified { .. }
                | EngineError::MalformedEnvelope { .. }
        )
    }
}

/// Network client specific errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Node RPC communication failures
    #[error("RPC communication failed: {source}")]
    Rpc {
        #[from]
        source: bitcoincore_rpc::Error,
    },

    /// HTTP request failures
    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// The node or explorer refused the transaction
    #[error("Broadcast rejected: {message}")]
    Rejected { message: String },

    /// API response validation errors
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

/// Result type alias for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::locktime("tiers must increase");
        assert!(matches!(err, EngineError::InvalidLocktime { .. }));
        assert_eq!(err.to_string(), "Invalid locktime: tiers must increase");

        let err = EngineError::fee_mismatch("claim output");
        assert!(err.is_delegation_rejection());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_classification() {
        let network_err: EngineError = NetworkError::Rejected {
            message: "bad-txns-inputs-missingorspent".to_string(),
        }
        .into();
        assert!(network_err.is_retryable());
        assert!(!network_err.is_delegation_rejection());

        let funds = EngineError::InsufficientFunds {
            required: 10,
            available: 5,
        };
        assert!(!funds.is_retryable());
    }
}
