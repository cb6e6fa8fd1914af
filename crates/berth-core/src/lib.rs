//! Core types and repository traits for the berth control plane.
//!
//! This crate provides:
//! - ID newtypes shared across the orchestrator and agent
//! - The domain entities the core reasons about (nodes, apps, proxies,
//!   registration tokens)
//! - Typed repository traits through which the core consumes the
//!   collaborator-owned relational store, plus in-memory reference
//!   implementations used by tests and the default wiring

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod model;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use model::{
    App, AppStatus, DeployTrigger, Node, NodeStatus, PortMapping, Proxy, RegistrationToken,
};
pub use store::{
    AppStore, InMemoryAppStore, InMemoryNodeStore, InMemoryProxyStore, InMemoryTokenStore,
    NodeStore, ProxyStore, TokenStore,
};
pub use types::{AppId, ConnectionId, NodeId, OwnerId, ProxyId, Timestamp};
