//! Cryptographic error types.

use thiserror::Error;

/// Errors produced by identity and signature operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key or signature had the wrong byte length.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// What was being decoded ("key" or "signature").
        what: &'static str,
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// The public key bytes do not describe a valid curve point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The signature does not verify against the message and key.
    #[error("signature verification failed")]
    VerificationFailed,

    /// A base64-encoded key or signature failed to decode.
    #[error("invalid base64 encoding")]
    InvalidBase64,

    /// A hex-encoded key failed to decode.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// Reading or writing a key file failed.
    #[error("key file error: {0}")]
    KeyFile(String),
}

/// Result alias for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
