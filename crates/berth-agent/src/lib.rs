//! The berth agent runtime.
//!
//! Installed on the user's server. Owns a persistent Ed25519 identity,
//! maintains a single outbound session to the orchestrator, verifies every
//! inbound command against the cached orchestrator key, and executes it
//! locally: Git deploys with build/supervise/health-check/rollback,
//! reverse-proxy provisioning, service control, runtime and database
//! management. Logs and status transitions stream back over the same
//! session.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod exec;
pub mod identity;
pub mod logbuf;
pub mod procreg;
pub mod runner;
pub mod session;
pub mod supervisor;
pub mod verify;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use identity::{AgentIdentity, OrchestratorKeyCache};
pub use verify::{CommandVerifier, VerifyError};
