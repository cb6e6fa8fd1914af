//! Domain entities the core reasons about.
//!
//! These mirror the collaborator-owned relational records, carrying only
//! the attributes the connection fabric and deployment pipeline use.

use std::collections::BTreeMap;

use berth_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use crate::types::{AppId, NodeId, OwnerId, ProxyId, Timestamp};

/// Whether an agent currently holds an authorized session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// An authorized session is live.
    Online,
    /// No authorized session.
    Offline,
}

/// The persisted record of an agent identity.
///
/// A node exists if and only if its public key is stored; the key is the
/// identity, the row is its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Opaque node identifier.
    pub id: NodeId,
    /// Owning account.
    pub owner_id: OwnerId,
    /// The agent's Ed25519 public key.
    pub public_key: PublicKey,
    /// Live connection status, toggled by the session registry.
    pub status: NodeStatus,
    /// Version string reported by the agent on its last handshake.
    pub agent_version: String,
    /// When the node was first registered.
    pub created_at: Timestamp,
}

/// A single-use secret authorizing the first connection of a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    /// The token value handed to the operator.
    pub value: String,
    /// Account the new node will belong to.
    pub owner_id: OwnerId,
    /// Expiry instant; tokens are short-lived.
    pub expires_at: Timestamp,
    /// Set once the token has admitted a registration.
    pub consumed: bool,
}

impl RegistrationToken {
    /// Mint a fresh token for `owner_id` expiring after `ttl`.
    #[must_use]
    pub fn mint(owner_id: OwnerId, ttl: chrono::Duration) -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::rngs::OsRng, &mut bytes[..]);
        Self {
            value: hex::encode(bytes),
            owner_id,
            expires_at: Timestamp::now() + ttl,
            consumed: false,
        }
    }
}

/// One exposed port of an app; exactly one is the main (health-checked)
/// port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// TCP port the app listens on.
    pub port: u16,
    /// Whether this is the main port (proxied, health-checked).
    pub main: bool,
}

/// Lifecycle state of an app as last reported by its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Never deployed or explicitly stopped.
    Stopped,
    /// A deploy run is in flight.
    Deploying,
    /// The supervised process is serving.
    Running,
    /// The last run ended in terminal failure.
    Failed,
}

/// A deployable application bound to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Opaque app identifier; also keys the working directory on the agent.
    pub id: AppId,
    /// Owning account.
    pub owner_id: OwnerId,
    /// Node the app runs on.
    pub node_id: NodeId,
    /// Git repository URL deploys are pulled from.
    pub repo_url: String,
    /// Branch deployed when a trigger carries no commit hash.
    pub branch: String,
    /// Exposed ports; exactly one marked main.
    pub ports: Vec<PortMapping>,
    /// Environment passed to the supervised process.
    pub env: BTreeMap<String, String>,
    /// Last reported lifecycle state.
    pub status: AppStatus,
    /// Per-app hot-path allowlist: paths whose changes never require a
    /// rebuild. Merged with the agent's built-in defaults.
    #[serde(default)]
    pub skip_build_paths: Vec<String>,
}

impl App {
    /// The main port, if one is configured.
    #[must_use]
    pub fn main_port(&self) -> Option<u16> {
        self.ports.iter().find(|p| p.main).map(|p| p.port)
    }
}

/// A reverse-proxy virtual host provisioned on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    /// Opaque proxy identifier.
    pub id: ProxyId,
    /// Owning account.
    pub owner_id: OwnerId,
    /// Node the vhost lives on.
    pub node_id: NodeId,
    /// The public domain. Unique per owner.
    pub domain: String,
    /// Upstream port the vhost forwards to.
    pub port: u16,
    /// Whether a TLS certificate was acquired.
    pub ssl_enabled: bool,
    /// App this proxy fronts, when it fronts one.
    pub app_id: Option<AppId>,
}

/// A deploy trigger delivered by the webhook collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployTrigger {
    /// Repository the push landed on.
    pub repo_url: String,
    /// Commit hash to deploy.
    pub commit_hash: String,
    /// Branch the push landed on.
    pub branch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_unique_and_unconsumed() {
        let owner = OwnerId::new();
        let a = RegistrationToken::mint(owner, chrono::Duration::minutes(10));
        let b = RegistrationToken::mint(owner, chrono::Duration::minutes(10));
        assert_ne!(a.value, b.value);
        assert!(!a.consumed);
        assert!(!a.expires_at.is_past());
    }

    #[test]
    fn main_port_picks_the_marked_mapping() {
        let app = App {
            id: AppId::new(),
            owner_id: OwnerId::new(),
            node_id: NodeId::new(),
            repo_url: "https://example.com/repo.git".into(),
            branch: "main".into(),
            ports: vec![
                PortMapping { port: 9100, main: false },
                PortMapping { port: 3000, main: true },
            ],
            env: BTreeMap::new(),
            status: AppStatus::Stopped,
            skip_build_paths: Vec::new(),
        };
        assert_eq!(app.main_port(), Some(3000));
    }
}
