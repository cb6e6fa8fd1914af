//! Wire protocol for the berth control plane.
//!
//! Every message is UTF-8 JSON, one message per WebSocket text frame, with a
//! `type` string as discriminator. Three tag spaces exist:
//!
//! - [`AgentFrame`]: everything an agent sends the orchestrator (handshake
//!   identity frames, challenge responses, and the report/stream frames);
//! - [`ControlFrame`]: the unsigned protocol frames the orchestrator sends
//!   an agent (`CHALLENGE`, `AUTHORIZED`, `REGISTERED`, `ERROR`);
//! - [`Command`] inside a [`SignedCommand`]: every privileged instruction,
//!   carrying a millisecond timestamp, a fresh nonce, and an Ed25519
//!   signature over the canonical serialization.
//!
//! Dashboards speak [`DashboardIntent`] (unsigned; the orchestrator re-emits
//! them as signed commands) and receive [`DashboardEvent`]s plus node-tagged
//! pass-throughs of agent report frames.
//!
//! Frames are validated at the edge: receivers parse into these types once
//! and work with typed values internally. Unknown `type` values on
//! non-handshake frames are ignored by receivers.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod command;
pub mod dashboard;
pub mod error;
pub mod frames;
pub mod signed;
pub mod types;

pub use command::{
    Command, DatabaseSpec, DeploySpec, ProvisionDomainSpec, RemoveDatabaseSpec, RuntimeSpec,
    ShutdownSpec, UpdateAgentSpec,
};
pub use dashboard::{DashboardEvent, DashboardIntent, IntentErrorCode, NodeSummary};
pub use error::{ProtoError, ProtoResult};
pub use frames::{
    AgentFrame, ControlFrame, HostStats, OrchestratorFrame, RuntimeInfo, ServerStatusReport,
    ServiceInfo,
};
pub use signed::{SignedCommand, fresh_nonce};
pub use types::{
    AgentUpdatePhase, AppActionKind, DatabaseEngine, DeployPhase, LogStreamKind, ReportStatus,
    ServiceActionKind, ShutdownMode,
};
