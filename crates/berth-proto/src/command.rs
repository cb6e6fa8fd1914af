//! Signed command payloads.
//!
//! One variant per privileged instruction the orchestrator can send an
//! agent. The enum is adjacently tagged so the wire shape is
//! `{"type": "DEPLOY", "payload": {...}}`; [`SignedCommand`] adds the
//! timestamp, nonce, and signature around it.
//!
//! [`SignedCommand`]: crate::signed::SignedCommand

use std::collections::BTreeMap;

use berth_core::{AppId, PortMapping};
use berth_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use crate::types::{
    AppActionKind, DatabaseEngine, ServiceActionKind, ShutdownMode,
};

/// Everything the agent needs to run one deployment.
///
/// The agent holds no repository access of its own, so the app's
/// configuration travels with the command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    /// App being deployed; keys the working directory.
    pub app_id: AppId,
    /// Git repository URL.
    pub repo_url: String,
    /// Branch to deploy when no commit hash is pinned.
    pub branch: String,
    /// Exact commit to deploy (webhook triggers carry one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    /// Environment for the supervised process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Exposed ports; one marked main.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Per-app additions to the non-code allowlist.
    #[serde(default)]
    pub skip_build_paths: Vec<String>,
}

/// Reverse-proxy provisioning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionDomainSpec {
    /// Public domain for the vhost.
    pub domain: String,
    /// Upstream port the vhost forwards to.
    pub port: u16,
    /// Whether to acquire a TLS certificate.
    pub ssl: bool,
    /// App the vhost fronts, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<AppId>,
}

/// Toolchain package operation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Runtime name (`node`, `python3`, `golang`, ...).
    pub runtime: String,
    /// Specific version, when the package manager supports pinning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Database create/reset parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Engine to operate on.
    pub engine: DatabaseEngine,
    /// Database (and role) name.
    pub name: String,
}

/// Database removal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveDatabaseSpec {
    /// Engine to operate on.
    pub engine: DatabaseEngine,
    /// Database (and role) name.
    pub name: String,
    /// Whether to drop the data too.
    pub remove_data: bool,
}

/// Agent self-update parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgentSpec {
    /// Where to download the new bundle.
    pub bundle_url: String,
    /// Version the bundle claims to be.
    pub version: String,
    /// Hex SHA-256 of the bundle, when the caller knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Agent shutdown parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSpec {
    /// Stop only, or stop and uninstall.
    pub mode: ShutdownMode,
}

/// A privileged instruction from the orchestrator to an agent.
///
/// Every variant causes a side effect on the agent's host and is therefore
/// only ever delivered inside a signed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Run the deployment pipeline.
    Deploy(DeploySpec),

    /// Control a supervised app process.
    #[serde(rename_all = "camelCase")]
    AppAction {
        /// Target app.
        app_id: AppId,
        /// What to do with it.
        action: AppActionKind,
    },

    /// Write a reverse-proxy vhost, acquire TLS, reload the proxy.
    ProvisionDomain(ProvisionDomainSpec),

    /// Remove a vhost and its certificate, reload the proxy.
    #[serde(rename_all = "camelCase")]
    DeleteProxy {
        /// Domain to remove.
        domain: String,
    },

    /// Control a system service.
    #[serde(rename_all = "camelCase")]
    ServiceAction {
        /// Service name (`nginx`, the process supervisor, ...).
        service: String,
        /// Action to apply.
        action: ServiceActionKind,
    },

    /// Fetch recent log lines for an app.
    #[serde(rename_all = "camelCase")]
    GetLogs {
        /// Target app.
        app_id: AppId,
        /// Maximum lines to return.
        lines: u32,
    },

    /// Install a toolchain runtime.
    InstallRuntime(RuntimeSpec),
    /// Update a toolchain runtime.
    UpdateRuntime(RuntimeSpec),
    /// Remove a toolchain runtime.
    RemoveRuntime(RuntimeSpec),

    /// Create a database with fresh loopback-bound credentials.
    ConfigureDatabase(DatabaseSpec),
    /// Reset credentials for an existing database.
    ReconfigureDatabase(DatabaseSpec),
    /// Remove a database and optionally its data.
    RemoveDatabase(RemoveDatabaseSpec),

    /// Snapshot detected runtimes, databases, services, and host stats.
    GetServerStatus,

    /// Fetch the infrastructure operation log ring.
    #[serde(rename_all = "camelCase")]
    GetInfrastructureLogs {
        /// Maximum lines to return.
        lines: u32,
    },

    /// Clear the infrastructure operation log ring.
    ClearInfrastructureLogs,

    /// Fetch recent journal lines for a system service.
    #[serde(rename_all = "camelCase")]
    GetServiceLogs {
        /// Service name.
        service: String,
        /// Maximum lines to return.
        lines: u32,
    },

    /// Download and swap in a new agent bundle, then restart.
    UpdateAgent(UpdateAgentSpec),

    /// Stop the agent, optionally purging the install.
    ShutdownAgent(ShutdownSpec),

    /// Generate a fresh identity keypair and reconnect with it.
    RegenerateIdentity,

    /// Rotate the orchestrator signing key. Signed with the *old* key;
    /// on verification the agent swaps its cached key to this one.
    #[serde(rename_all = "camelCase")]
    CpKeyRotation {
        /// The orchestrator's new public key.
        new_public_key: PublicKey,
    },
}

impl Command {
    /// The wire name of this command (`DEPLOY`, `APP_ACTION`, ...).
    ///
    /// # Panics
    ///
    /// Never: every variant serializes to a tagged object.
    #[must_use]
    pub fn type_name(&self) -> String {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_owned(),
            _ => "UNKNOWN".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_names_are_screaming_snake() {
        let cmd = Command::AppAction {
            app_id: AppId::new(),
            action: AppActionKind::Restart,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], "APP_ACTION");
        assert_eq!(value["payload"]["action"], "restart");

        assert_eq!(Command::GetServerStatus.type_name(), "GET_SERVER_STATUS");
        assert_eq!(
            Command::ClearInfrastructureLogs.type_name(),
            "CLEAR_INFRASTRUCTURE_LOGS"
        );
    }

    #[test]
    fn unit_commands_omit_payload() {
        let value = serde_json::to_value(Command::GetServerStatus).unwrap();
        assert_eq!(value["type"], "GET_SERVER_STATUS");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn deploy_spec_roundtrips_with_camel_case_fields() {
        let cmd = Command::Deploy(DeploySpec {
            app_id: AppId::new(),
            repo_url: "https://git.example.com/site.git".into(),
            branch: "main".into(),
            commit_hash: Some("abc123".into()),
            env: BTreeMap::new(),
            ports: vec![PortMapping { port: 3000, main: true }],
            skip_build_paths: vec!["docs/".into()],
        });
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"repoUrl\""));
        assert!(json.contains("\"commitHash\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_name(), "DEPLOY");
    }
}
