//! Session frames for the agent socket.

use berth_core::{AppId, ConnectionId, NodeId};
use berth_crypto::{PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, ProtoResult};
use crate::signed::SignedCommand;
use crate::types::{
    AgentUpdatePhase, AppActionKind, DatabaseEngine, DeployPhase, LogStreamKind,
    ServiceActionKind, ShutdownMode,
};

/// One detected runtime on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    /// Runtime name (`node`, `python3`, ...).
    pub name: String,
    /// Version string as reported by the binary.
    pub version: String,
}

/// One system service and its active state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Whether systemd reports it active.
    pub active: bool,
}

/// Host resource snapshot, read from `/proc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    /// One-minute load average.
    pub load_avg: f64,
    /// Total memory in kilobytes.
    pub mem_total_kb: u64,
    /// Available memory in kilobytes.
    pub mem_available_kb: u64,
    /// Seconds since boot.
    pub uptime_secs: u64,
}

/// Full server snapshot answering `GET_SERVER_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusReport {
    /// Agent version.
    pub agent_version: String,
    /// Detected toolchain runtimes.
    pub runtimes: Vec<RuntimeInfo>,
    /// Detected database engines.
    pub databases: Vec<String>,
    /// System services of interest and their state.
    pub services: Vec<ServiceInfo>,
    /// Host resource stats.
    pub host: HostStats,
}

/// Every frame an agent sends the orchestrator.
///
/// `Connect`, `Register`, and `Response` are handshake frames; everything
/// else requires an authorized session and is fanned out to the owner's
/// dashboards tagged with the originating node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentFrame {
    /// First frame of an already-registered agent.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// The agent's identity key.
        public_key: PublicKey,
        /// Agent version string.
        version: String,
    },

    /// First frame of a new agent, consuming a registration token.
    #[serde(rename_all = "camelCase")]
    Register {
        /// Single-use registration token.
        token: String,
        /// The agent's identity key.
        public_key: PublicKey,
        /// Agent version string.
        version: String,
    },

    /// Challenge response: the nonce signed with the identity key.
    #[serde(rename_all = "camelCase")]
    Response {
        /// `Ed25519-sign(agentKey, nonce)`.
        signature: Signature,
    },

    /// One build/run output line from a deploy.
    #[serde(rename_all = "camelCase")]
    LogStream {
        /// App the line belongs to.
        app_id: AppId,
        /// Which child stream produced it.
        stream: LogStreamKind,
        /// The line, without trailing newline.
        line: String,
    },

    /// Deploy pipeline phase transition.
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        /// App the run belongs to.
        app_id: AppId,
        /// New phase.
        phase: DeployPhase,
        /// Commit the run is deploying.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        /// Human-readable detail (stderr tail on failures).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Ports the supervised process actually listens on.
    #[serde(rename_all = "camelCase")]
    DetectedPorts {
        /// App the process belongs to.
        app_id: AppId,
        /// Observed listening ports.
        ports: Vec<u16>,
    },

    /// Snapshot answering `GET_SERVER_STATUS` (also pushed unsolicited
    /// after each successful handshake so dashboards re-sync).
    #[serde(rename_all = "camelCase")]
    ServerStatusResponse {
        /// The snapshot.
        status: ServerStatusReport,
    },

    /// Terminal report of `APP_ACTION`.
    #[serde(rename_all = "camelCase")]
    AppActionResult {
        /// App the action targeted.
        app_id: AppId,
        /// The action that ran.
        action: AppActionKind,
        /// Whether it succeeded.
        ok: bool,
        /// Failure detail, when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Terminal report of `PROVISION_DOMAIN`. On success the orchestrator
    /// records the proxy before auditing it.
    #[serde(rename_all = "camelCase")]
    ProxyProvisioned {
        /// The provisioned domain.
        domain: String,
        /// Upstream port.
        port: u16,
        /// Whether a TLS certificate was acquired.
        ssl_enabled: bool,
        /// App the vhost fronts, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<AppId>,
        /// Whether provisioning succeeded (partial changes are reverted
        /// on failure).
        ok: bool,
        /// Failure detail, when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Terminal report of `DELETE_PROXY`. Removing an absent domain is a
    /// success no-op.
    #[serde(rename_all = "camelCase")]
    ProxyDeleted {
        /// The removed domain.
        domain: String,
        /// Whether removal succeeded.
        ok: bool,
    },

    /// Terminal report of `SERVICE_ACTION`.
    #[serde(rename_all = "camelCase")]
    ServiceActionResult {
        /// The service acted on.
        service: String,
        /// The action that ran.
        action: ServiceActionKind,
        /// Whether the service command exited zero.
        ok: bool,
        /// Captured stderr tail on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// One output line from a runtime/database infrastructure operation.
    #[serde(rename_all = "camelCase")]
    InfrastructureLog {
        /// Operation the line belongs to (`install_runtime:node`, ...).
        operation: String,
        /// Which child stream produced it.
        stream: LogStreamKind,
        /// The line.
        line: String,
    },

    /// Terminal report of `INSTALL_RUNTIME`.
    #[serde(rename_all = "camelCase")]
    RuntimeInstalled {
        /// Runtime name.
        runtime: String,
        /// Installed version, when detectable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        /// Whether the operation succeeded.
        ok: bool,
    },

    /// Terminal report of `UPDATE_RUNTIME`.
    #[serde(rename_all = "camelCase")]
    RuntimeUpdated {
        /// Runtime name.
        runtime: String,
        /// Updated version, when detectable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        /// Whether the operation succeeded.
        ok: bool,
    },

    /// Terminal report of `REMOVE_RUNTIME`.
    #[serde(rename_all = "camelCase")]
    RuntimeRemoved {
        /// Runtime name.
        runtime: String,
        /// Whether the operation succeeded.
        ok: bool,
    },

    /// Terminal report of `CONFIGURE_DATABASE`.
    ///
    /// `connection_string` carries the real credential and is delivered
    /// only to the requester; the orchestrator fans out
    /// `connection_string_redacted` instead.
    #[serde(rename_all = "camelCase")]
    DatabaseConfigured {
        /// Engine operated on.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
        /// Connection string with the real password.
        connection_string: String,
        /// Connection string with the password masked.
        connection_string_redacted: String,
    },

    /// Terminal report of `RECONFIGURE_DATABASE`. Same redaction contract
    /// as `DatabaseConfigured`.
    #[serde(rename_all = "camelCase")]
    DatabaseReconfigured {
        /// Engine operated on.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
        /// Connection string with the real password.
        connection_string: String,
        /// Connection string with the password masked.
        connection_string_redacted: String,
    },

    /// Terminal report of `REMOVE_DATABASE`.
    #[serde(rename_all = "camelCase")]
    DatabaseRemoved {
        /// Engine operated on.
        engine: DatabaseEngine,
        /// Database name.
        name: String,
        /// Whether the operation succeeded.
        ok: bool,
    },

    /// Agent-local warning or error mirrored to dashboards.
    #[serde(rename_all = "camelCase")]
    SystemLog {
        /// Severity (`warn`, `error`).
        level: String,
        /// The message.
        message: String,
    },

    /// Self-update phase transition.
    #[serde(rename_all = "camelCase")]
    AgentUpdateStatus {
        /// Current phase.
        phase: AgentUpdatePhase,
        /// Version being installed.
        version: String,
        /// Failure detail, when failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// One output line from the self-update.
    #[serde(rename_all = "camelCase")]
    AgentUpdateLog {
        /// The line.
        line: String,
    },

    /// Acknowledgement sent just before the agent closes on
    /// `SHUTDOWN_AGENT`.
    #[serde(rename_all = "camelCase")]
    AgentShutdownAck {
        /// The mode that was requested.
        mode: ShutdownMode,
    },

    /// Reply to `GET_INFRASTRUCTURE_LOGS`.
    #[serde(rename_all = "camelCase")]
    InfrastructureLogsResponse {
        /// Most recent lines, oldest first.
        lines: Vec<String>,
    },

    /// Reply to `GET_SERVICE_LOGS`.
    #[serde(rename_all = "camelCase")]
    ServiceLogsResponse {
        /// Service the lines belong to.
        service: String,
        /// Most recent journal lines, oldest first.
        lines: Vec<String>,
    },
}

impl AgentFrame {
    /// Whether this frame may drop under dashboard backpressure.
    ///
    /// Log-class frames drop oldest-first when a dashboard is slow;
    /// status-class frames are never dropped.
    #[must_use]
    pub fn is_log_class(&self) -> bool {
        matches!(
            self,
            Self::LogStream { .. }
                | Self::InfrastructureLog { .. }
                | Self::SystemLog { .. }
                | Self::AgentUpdateLog { .. }
        )
    }
}

/// Unsigned protocol frames from the orchestrator to an agent.
///
/// These never carry a signature; everything else on that socket does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    /// Fresh 128-bit nonce the agent must sign.
    #[serde(rename_all = "camelCase")]
    Challenge {
        /// Hex-encoded nonce bound to this connection.
        nonce: String,
    },

    /// The session is authorized and routable.
    #[serde(rename_all = "camelCase")]
    Authorized {
        /// Server-side session identifier.
        session_id: ConnectionId,
    },

    /// Registration succeeded; sent before `AUTHORIZED` so the agent can
    /// cache the orchestrator key for command verification.
    #[serde(rename_all = "camelCase")]
    Registered {
        /// The new node's identifier.
        server_id: NodeId,
        /// The orchestrator's public key.
        cp_public_key: PublicKey,
    },

    /// Fatal protocol or authentication error; the connection closes.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Reason, for the agent's logs.
        message: String,
    },
}

/// Everything an agent can receive: an unsigned protocol frame or a signed
/// command.
#[derive(Debug, Clone)]
pub enum OrchestratorFrame {
    /// Handshake / error frame.
    Control(ControlFrame),
    /// Signed command envelope.
    Command(SignedCommand),
}

impl OrchestratorFrame {
    /// Decode one wire message.
    ///
    /// Protocol frames are never signed, so the `signature` field is the
    /// discriminator between the two tag spaces.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError`] if the text is not a JSON object with a
    /// `type`, or does not parse as the indicated frame.
    pub fn decode(text: &str) -> ProtoResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or(ProtoError::NotAnObject)?;
        if !obj.contains_key("type") {
            return Err(ProtoError::MissingType);
        }
        if obj.contains_key("signature") {
            Ok(Self::Command(serde_json::from_value(value)?))
        } else {
            Ok(Self::Control(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use berth_crypto::Keypair;

    #[test]
    fn agent_frame_tags_match_protocol_names() {
        let frame = AgentFrame::StatusUpdate {
            app_id: AppId::new(),
            phase: DeployPhase::Cloning,
            commit_hash: Some("abc123".into()),
            message: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "STATUS_UPDATE");
        assert_eq!(value["commitHash"], "abc123");
        assert_eq!(value["phase"], "cloning");
    }

    #[test]
    fn register_frame_shape() {
        let key = Keypair::generate().public_key();
        let frame = AgentFrame::Register {
            token: "tok-A".into(),
            public_key: key,
            version: "1.0.0".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "REGISTER");
        assert_eq!(value["token"], "tok-A");
        assert_eq!(value["publicKey"], key.to_base64());
    }

    #[test]
    fn log_class_split() {
        let log = AgentFrame::LogStream {
            app_id: AppId::new(),
            stream: LogStreamKind::Stdout,
            line: "compiled".into(),
        };
        let status = AgentFrame::StatusUpdate {
            app_id: AppId::new(),
            phase: DeployPhase::Success,
            commit_hash: None,
            message: None,
        };
        assert!(log.is_log_class());
        assert!(!status.is_log_class());
    }

    #[test]
    fn decode_routes_on_signature_presence() {
        let control = serde_json::to_string(&ControlFrame::Challenge {
            nonce: "00".repeat(16),
        })
        .unwrap();
        assert!(matches!(
            OrchestratorFrame::decode(&control).unwrap(),
            OrchestratorFrame::Control(ControlFrame::Challenge { .. })
        ));

        let keypair = Keypair::generate();
        let signed = SignedCommand::sign(Command::GetServerStatus, &keypair).unwrap();
        let wire = serde_json::to_string(&signed).unwrap();
        assert!(matches!(
            OrchestratorFrame::decode(&wire).unwrap(),
            OrchestratorFrame::Command(_)
        ));
    }

    #[test]
    fn decode_rejects_untyped_frames() {
        assert!(matches!(
            OrchestratorFrame::decode("{\"nonce\":\"aa\"}"),
            Err(ProtoError::MissingType)
        ));
        assert!(matches!(
            OrchestratorFrame::decode("[1,2]"),
            Err(ProtoError::NotAnObject)
        ));
    }
}
