//! The berth orchestrator.
//!
//! A single process that accepts inbound agent and dashboard sessions on
//! distinct WebSocket endpoints, owns the in-memory session registry,
//! issues signed commands, and fans log/status frames out to every
//! dashboard subscribed to an owner.
//!
//! # Locking design
//!
//! The session registry and the per-dashboard outbound queues are the only
//! shared mutable state. Their locks are taken for brief synchronous
//! sections only — insert, remove, lookup, enqueue — and never held across
//! an await point. Everything that suspends (socket I/O, repository
//! queries) happens outside the locks on clones or channel handles.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;

pub use auth::{AllowAllGate, CookieOwnerAuth, DashboardAuth, LimitGate};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use keys::CommandSigner;
pub use queue::{FrameClass, OutboundQueue};
pub use registry::{AgentIdentity, SessionRegistry};
pub use server::Server;
pub use state::{OrchestratorState, SharedState};
