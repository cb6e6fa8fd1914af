//! Orchestrator error types.

use berth_core::NodeId;
use thiserror::Error;

/// Errors raised inside the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A frame arrived that does not match the session's state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake authentication failed (bad signature, bad token,
    /// unknown public key).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A handshake step did not complete within the configured bound.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The target node holds no authorized session.
    #[error("node offline: {0}")]
    NodeOffline(NodeId),

    /// The agent session's outbound queue is full; the session is treated
    /// as stuck and closed.
    #[error("agent session stuck: {0}")]
    SessionStuck(NodeId),

    /// Repository failure.
    #[error(transparent)]
    Store(#[from] berth_core::StoreError),

    /// Wire encode/decode or signature failure.
    #[error(transparent)]
    Proto(#[from] berth_proto::ProtoError),

    /// Key handling failure.
    #[error(transparent)]
    Crypto(#[from] berth_crypto::CryptoError),

    /// Configuration file problem.
    #[error("config error: {0}")]
    Config(String),

    /// Socket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for OrchestratorError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Proto(berth_proto::ProtoError::from(e))
    }
}

/// Result alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
