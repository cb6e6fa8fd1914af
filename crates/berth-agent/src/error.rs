//! Agent error types.

use thiserror::Error;

/// Errors raised inside the agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The orchestrator sent something that does not fit the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The orchestrator refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The session closed (the supervisor reconnects with backoff).
    #[error("session lost: {0}")]
    SessionLost(String),

    /// A child process could not be spawned or controlled.
    #[error("process error: {0}")]
    Process(String),

    /// A deploy step failed (the pipeline reports and may roll back).
    #[error("{0}")]
    Execution(String),

    /// Key handling failure.
    #[error(transparent)]
    Crypto(#[from] berth_crypto::CryptoError),

    /// Wire encode/decode failure.
    #[error(transparent)]
    Proto(#[from] berth_proto::ProtoError),

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

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Proto(berth_proto::ProtoError::from(e))
    }
}

/// Result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
