//! Dashboard socket frames.
//!
//! Dashboards never talk to agents. They submit unsigned *intents*; the
//! orchestrator authorizes each intent, re-emits it as a signed command to
//! the right agent, and streams events back.

use berth_core::{AppId, NodeId, NodeStatus, Timestamp};
use serde::{Deserialize, Serialize};

use crate::types::{
    AppActionKind, DatabaseEngine, DeployPhase, LogStreamKind, ServiceActionKind, ShutdownMode,
};

/// An unsigned control-plane intent from a dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DashboardIntent {
    /// Deploy an app (commit defaults to the configured branch tip).
    #[serde(rename_all = "camelCase")]
    Deploy {
        /// Target app.
        app_id: AppId,
        /// Exact commit, when pinned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
    },

    /// Control a supervised app process.
    #[serde(rename_all = "camelCase")]
    AppAction {
        /// Target app.
        app_id: AppId,
        /// Action to apply.
        action: AppActionKind,
    },

    /// Provision a reverse-proxy domain on a node.
    #[serde(rename_all = "camelCase")]
    ProvisionDomain {
        /// Target node.
        node_id: NodeId,
        /// Public domain.
        domain: String,
        /// Upstream port.
        port: u16,
        /// Whether to acquire TLS.
        ssl: bool,
        /// App the vhost fronts, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<AppId>,
    },

    /// Remove a reverse-proxy domain.
    #[serde(rename_all = "camelCase")]
    DeleteProxy {
        /// Target node.
        node_id: NodeId,
        /// Domain to remove.
        domain: String,
    },

    /// Control a system service on a node.
    #[serde(rename_all = "camelCase")]
    ServiceAction {
        /// Target node.
        node_id: NodeId,
        /// Service name.
        service: String,
        /// Action to apply.
        action: ServiceActionKind,
    },

    /// Fetch recent app log lines.
    #[serde(rename_all = "camelCase")]
    GetLogs {
        /// Target app.
        app_id: AppId,
        /// Maximum lines.
        #[serde(default = "default_log_lines")]
        lines: u32,
    },

    /// Install a toolchain runtime on a node.
    #[serde(rename_all = "camelCase")]
    InstallRuntime {
        /// Target node.
        node_id: NodeId,
        /// Runtime name.
        runtime: String,
        /// Pinned version, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Update a toolchain runtime on a node.
    #[serde(rename_all = "camelCase")]
    UpdateRuntime {
        /// Target node.
        node_id: NodeId,
        /// Runtime name.
        runtime: String,
        /// Pinned version, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Remove a toolchain runtime from a node.
    #[serde(rename_all = "camelCase")]
    RemoveRuntime {
        /// Target node.
        node_id: NodeId,
        /// Runtime name.
        runtime: String,
    },

    /// Create a database with fresh credentials.
    #[serde(rename_all = "camelCase")]
    ConfigureDatabase {
        /// Target node.
        node_id: NodeId,
        /// Engine.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
    },

    /// Reset credentials for an existing database.
    #[serde(rename_all = "camelCase")]
    ReconfigureDatabase {
        /// Target node.
        node_id: NodeId,
        /// Engine.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
    },

    /// Remove a database.
    #[serde(rename_all = "camelCase")]
    RemoveDatabase {
        /// Target node.
        node_id: NodeId,
        /// Engine.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
        /// Whether to drop the data too.
        remove_data: bool,
    },

    /// Request a server snapshot.
    #[serde(rename_all = "camelCase")]
    GetServerStatus {
        /// Target node.
        node_id: NodeId,
    },

    /// Fetch the node's infrastructure operation log.
    #[serde(rename_all = "camelCase")]
    GetInfrastructureLogs {
        /// Target node.
        node_id: NodeId,
        /// Maximum lines.
        #[serde(default = "default_log_lines")]
        lines: u32,
    },

    /// Clear the node's infrastructure operation log.
    #[serde(rename_all = "camelCase")]
    ClearInfrastructureLogs {
        /// Target node.
        node_id: NodeId,
    },

    /// Fetch journal lines for a system service.
    #[serde(rename_all = "camelCase")]
    GetServiceLogs {
        /// Target node.
        node_id: NodeId,
        /// Service name.
        service: String,
        /// Maximum lines.
        #[serde(default = "default_log_lines")]
        lines: u32,
    },

    /// Update the agent on a node.
    #[serde(rename_all = "camelCase")]
    UpdateAgent {
        /// Target node.
        node_id: NodeId,
        /// Bundle download URL.
        bundle_url: String,
        /// Version the bundle claims to be.
        version: String,
    },

    /// Stop (and optionally uninstall) the agent on a node.
    #[serde(rename_all = "camelCase")]
    ShutdownAgent {
        /// Target node.
        node_id: NodeId,
        /// Stop or uninstall.
        mode: ShutdownMode,
    },

    /// Have the agent mint a fresh identity keypair.
    #[serde(rename_all = "camelCase")]
    RegenerateIdentity {
        /// Target node.
        node_id: NodeId,
    },

    /// Mint a registration token for this owner.
    CreateRegistrationToken,

    /// Rotate the orchestrator signing key.
    RotateOrchestratorKey,
}

fn default_log_lines() -> u32 {
    200
}

/// Typed reason an intent was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentErrorCode {
    /// The target node holds no authorized session. Commands are not
    /// queued for offline nodes.
    NodeOffline,
    /// The target record does not exist or belongs to another owner.
    NotFound,
    /// The owner's plan does not allow this operation.
    LimitExceeded,
    /// The dashboard session is not allowed to do this.
    Unauthorized,
    /// The intent was malformed or the orchestrator failed internally.
    Internal,
}

/// One node in the `INITIAL_STATE` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Node identifier.
    pub node_id: NodeId,
    /// Live status.
    pub status: NodeStatus,
    /// Agent version from the last handshake.
    pub agent_version: String,
}

/// Frames the orchestrator sends a dashboard.
///
/// Agent report frames are additionally passed through with their original
/// `type` and an injected `nodeId`; those are produced by the router, not
/// modelled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DashboardEvent {
    /// Snapshot sent once on subscribe.
    #[serde(rename_all = "camelCase")]
    InitialState {
        /// The owner's nodes.
        nodes: Vec<NodeSummary>,
        /// Recent activity entries, newest first.
        activity: Vec<serde_json::Value>,
    },

    /// A node's connection status changed.
    #[serde(rename_all = "camelCase")]
    ServerStatus {
        /// Node whose status changed.
        node_id: NodeId,
        /// The new status.
        status: NodeStatus,
    },

    /// Deploy pipeline phase transition, re-tagged from `STATUS_UPDATE`.
    #[serde(rename_all = "camelCase")]
    DeployStatus {
        /// Originating node.
        node_id: NodeId,
        /// App the run belongs to.
        app_id: AppId,
        /// New phase.
        phase: DeployPhase,
        /// Commit being deployed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        /// Failure detail, when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Deploy output line, re-tagged from `LOG_STREAM`.
    #[serde(rename_all = "camelCase")]
    DeployLog {
        /// Originating node.
        node_id: NodeId,
        /// App the line belongs to.
        app_id: AppId,
        /// Which child stream produced it.
        stream: LogStreamKind,
        /// The line.
        line: String,
    },

    /// A new activity log entry.
    #[serde(rename_all = "camelCase")]
    AuditUpdate {
        /// The appended entry.
        entry: serde_json::Value,
    },

    /// A minted registration token (reply to `CREATE_REGISTRATION_TOKEN`).
    #[serde(rename_all = "camelCase")]
    TokenCreated {
        /// The token value to paste into the agent install.
        token: String,
        /// When it expires.
        expires_at: Timestamp,
    },

    /// An intent was refused.
    #[serde(rename_all = "camelCase")]
    IntentError {
        /// Typed reason.
        code: IntentErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tags_match_protocol_names() {
        let intent = DashboardIntent::ProvisionDomain {
            node_id: NodeId::new(),
            domain: "app.example.com".into(),
            port: 3000,
            ssl: true,
            app_id: None,
        };
        let value = serde_json::to_value(&intent).unwrap();
        assert_eq!(value["type"], "PROVISION_DOMAIN");
        assert_eq!(value["nodeId"], serde_json::to_value(match intent {
            DashboardIntent::ProvisionDomain { node_id, .. } => node_id,
            _ => unreachable!(),
        }).unwrap());
    }

    #[test]
    fn get_logs_defaults_line_count() {
        let parsed: DashboardIntent = serde_json::from_str(
            &format!("{{\"type\":\"GET_LOGS\",\"appId\":\"{}\"}}", AppId::new()),
        )
        .unwrap();
        assert!(matches!(parsed, DashboardIntent::GetLogs { lines: 200, .. }));
    }

    #[test]
    fn event_tags_match_protocol_names() {
        let event = DashboardEvent::ServerStatus {
            node_id: NodeId::new(),
            status: NodeStatus::Online,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "SERVER_STATUS");
        assert_eq!(value["status"], "online");
    }
}
