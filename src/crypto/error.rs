//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
///
/// Envelope failures are deliberately split into distinct variants so
/// callers can tell a security failure (bad signature) apart from a
/// transport failure (stale clock, truncated payload).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The envelope timestamp is outside the freshness window
    #[error("Stale envelope: {age_ms} ms old, limit {max_age_ms} ms")]
    StaleEnvelope {
        /// How old the envelope was when opened, in milliseconds
        age_ms: u64,
        /// The freshness window that was applied
        max_age_ms: u64,
    },

    /// Signature verification failed - the envelope was tampered with
    /// or sealed under a different key
    #[error("Envelope signature verification failed")]
    InvalidSignature,

    /// The envelope passed authentication but its payload could not be
    /// decoded or parsed
    #[error("Malformed envelope payload: {0}")]
    MalformedPayload(String),

    /// The envelope nonce was already accepted under this secret
    #[error("Replayed envelope nonce")]
    ReplayedNonce,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
