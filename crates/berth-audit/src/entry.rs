//! Activity entry types.

use berth_core::{NodeId, OwnerId, Timestamp};
use berth_proto::ReportStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A node registered for the first time.
    NodeRegistered,
    /// A node's session was authorized.
    NodeConnected,
    /// A node's last session closed.
    ConnectionLost,
    /// A deploy run reached a terminal phase.
    Deploy,
    /// An app lifecycle action completed.
    AppAction,
    /// A proxy domain was provisioned.
    ProxyProvisioned,
    /// A proxy domain was removed.
    ProxyDeleted,
    /// A system service action completed.
    ServiceAction,
    /// A runtime install/update/remove completed.
    Runtime,
    /// A database configure/reconfigure/remove completed.
    Database,
    /// An agent self-update completed.
    AgentUpdate,
    /// An agent shut down on request.
    AgentShutdown,
    /// The orchestrator signing key was rotated.
    KeyRotation,
    /// A registration token was minted.
    TokenMinted,
    /// An intent was refused before dispatch.
    IntentRejected,
}

/// One append-only activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// Owner whose dashboards see this entry.
    pub owner_id: OwnerId,
    /// Node the event happened on, when node-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Event kind.
    pub kind: ActivityKind,
    /// Outcome.
    pub status: ReportStatus,
    /// Free-form details (command parameters, failure reasons).
    pub details: serde_json::Value,
    /// When the entry was appended.
    pub timestamp: Timestamp,
}

impl ActivityEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        node_id: Option<NodeId>,
        kind: ActivityKind,
        status: ReportStatus,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            node_id,
            kind,
            status,
            details,
            timestamp: Timestamp::now(),
        }
    }
}
