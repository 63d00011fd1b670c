//! # Error Types for Grail Custody
//!
//! A single error enum covers the cryptographic core, the custody pipeline and
//! the external collaborators (node RPC and spell prover). Every failure aborts
//! the current state transition; nothing in this crate retries on its own.

use thiserror::Error;

/// Main error type for all custody operations
#[derive(Debug, Error)]
pub enum GrailError {
    /// Malformed curve point or x-coordinate
    #[error("Invalid curve point: {reason}")]
    InvalidPoint { reason: String },

    /// Scalar outside its valid range
    #[error("Invalid scalar: {reason}")]
    InvalidScalar { reason: String },

    /// Tap trees carry one custody leaf or a custody leaf plus a recovery leaf
    #[error("Invalid tap tree leaf count: {count} (expected 1 or 2)")]
    InvalidLeafCount { count: usize },

    /// Control block requested for a leaf the tree does not have
    #[error("Leaf index {index} out of range for a tree with {leaves} leaves")]
    InvalidLeafIndex { index: usize, leaves: usize },

    /// Threshold outside 1..=cosigners
    #[error("Invalid threshold {threshold} for {cosigners} cosigners")]
    InvalidThreshold { threshold: usize, cosigners: usize },

    /// Fewer signing keys than the threshold demands
    #[error("Insufficient signers: threshold {required}, {available} available")]
    InsufficientSigners { required: usize, available: usize },

    /// Witness assembly needs exactly threshold signatures
    #[error("Wrong signature count: expected {expected}, got {actual}")]
    WrongSignatureCount { expected: usize, actual: usize },

    /// Signature from a key outside the authorized cosigner set
    #[error("Signer {public_key} is not an authorized cosigner")]
    UnauthorizedSigner { public_key: String },

    /// Referenced prior transaction is unknown to the node
    #[error("Previous state not found: transaction {txid} is not available")]
    PreviousStateNotFound { txid: String },

    /// The on-chain state record could not be parsed
    #[error("Malformed state record: {reason}")]
    MalformedStateRecord { reason: String },

    /// The proved transaction commits to something other than what was requested
    #[error("State commitment mismatch: expected {expected}, found {actual}")]
    StateCommitmentMismatch { expected: String, actual: String },

    /// Peg amounts do not balance
    #[error("Sanity check failed: {message}")]
    SanityCheckFailed { message: String },

    /// The external proof generator failed; message is passed through verbatim
    #[error("External prover failure: {message}")]
    ExternalProverFailure { message: String },

    /// Insufficient funds for operations
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    /// The wallet's token UTXOs do not cover a transfer
    #[error("Insufficient tokens: required {required}, available {available}")]
    InsufficientTokens { required: u64, available: u64 },

    /// No output of the transaction pays the expected address
    #[error("No output of {txid} pays {address}")]
    PaymentOutputNotFound { txid: String, address: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Errors during transaction construction or decoding
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Cryptographic library failures
    #[error("Cryptographic operation failed: {message}")]
    Cryptography { message: String },

    /// Address parsing and validation errors
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Bitcoin RPC communication failures
    #[error("RPC communication failed: {source}")]
    Rpc {
        #[from]
        source: bitcoincore_rpc::Error,
    },

    /// File and process I/O
    #[error("I/O operation failed: {source}")]
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

/// Result type alias for custody operations
pub type GrailResult<T> = Result<T, GrailError>;

impl GrailError {
    /// Create a configuration error with a message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cryptography error with a message
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Cryptography {
            message: message.into(),
        }
    }

    /// Create a transaction error with a message
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a prover failure carrying the prover's own output
    pub fn prover(message: impl Into<String>) -> Self {
        Self::ExternalProverFailure {
            message: message.into(),
        }
    }

    /// Create a malformed state record error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedStateRecord {
            reason: reason.into(),
        }
    }

    /// Errors a caller may retry by re-running the whole pipeline later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GrailError::PreviousStateNotFound { .. } | GrailError::Rpc { .. }
        )
    }

    /// Quorum violations are surfaced to the caller, never downgraded
    pub fn is_quorum_violation(&self) -> bool {
        matches!(
            self,
            GrailError::InsufficientSigners { .. }
                | GrailError::WrongSignatureCount { .. }
                | GrailError::UnauthorizedSigner { .. }
        )
    }

    /// Check if this error indicates a security issue
    pub fn is_security_critical(&self) -> bool {
        self.is_quorum_violation()
            || matches!(
                self,
                GrailError::StateCommitmentMismatch { .. }
                    | GrailError::InvalidPoint { .. }
                    | GrailError::InvalidScalar { .. }
                    | GrailError::Cryptography { .. }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let config_err = GrailError::config("missing app id");
        assert!(matches!(config_err, GrailError::Configuration { .. }));

        let prover_err = GrailError::prover("exit status 1: bad spell");
        assert_eq!(
            prover_err.to_string(),
            "External prover failure: exit status 1: bad spell"
        );
    }

    #[test]
    fn test_error_classification() {
        let missing = GrailError::PreviousStateNotFound {
            txid: "00".repeat(32),
        };
        assert!(missing.is_retryable());
        assert!(!missing.is_security_critical());

        let quorum = GrailError::InsufficientSigners {
            required: 2,
            available: 1,
        };
        assert!(quorum.is_quorum_violation());
        assert!(quorum.is_security_critical());
        assert!(!quorum.is_retryable());

        let prover = GrailError::prover("boom");
        assert!(!prover.is_retryable());

        let mismatch = GrailError::StateCommitmentMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(mismatch.is_security_critical());
    }
}
