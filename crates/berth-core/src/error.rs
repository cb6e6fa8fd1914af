//! Repository error types.

use thiserror::Error;

/// Errors surfaced by the repository layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// Record kind ("node", "app", "proxy", "token").
        what: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// A proxy domain is already provisioned for this owner.
    #[error("domain already provisioned: {domain}")]
    DuplicateDomain {
        /// The conflicting domain.
        domain: String,
    },

    /// The registration token is unknown.
    #[error("unknown registration token")]
    TokenUnknown,

    /// The registration token expired before use.
    #[error("registration token expired")]
    TokenExpired,

    /// The registration token was already consumed.
    #[error("registration token already consumed")]
    TokenConsumed,

    /// Internal storage failure (poisoned lock, backend I/O).
    #[error("store internal error: {0}")]
    Internal(String),
}

/// Result alias for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;
