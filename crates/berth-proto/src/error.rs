//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding, decoding, or verifying wire frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The frame was not valid JSON or did not match the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame is missing its `type` discriminator.
    #[error("frame has no type field")]
    MissingType,

    /// A frame was expected to be a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// A cryptographic check failed.
    #[error(transparent)]
    Crypto(#[from] berth_crypto::CryptoError),
}

/// Result alias for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
