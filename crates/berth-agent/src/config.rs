//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, AgentResult};

/// Built-in non-code allowlist: changes restricted to these paths never
/// require a rebuild. Entries ending in `/` match a directory prefix;
/// entries starting with `*.` match an extension; `NAME*` matches a
/// file-name prefix.
pub const DEFAULT_SKIP_BUILD_PATHS: &[&str] = &[
    "*.md",
    "*.txt",
    "docs/",
    ".github/",
    "LICENSE*",
];

/// Runtime configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Orchestrator base URL (`wss://cp.example.com` or `ws://...`).
    pub orchestrator_url: String,
    /// Directory for agent state (identity key, cached orchestrator key,
    /// app working trees). Created 0700.
    pub state_dir: PathBuf,
    /// Base reconnect delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Maximum reconnect delay in milliseconds.
    pub backoff_max_ms: u64,
    /// Command replay window in seconds (timestamp drift tolerance).
    pub replay_window_secs: u64,
    /// Handshake step timeout in seconds.
    pub handshake_timeout_secs: u64,
    /// Health-check probe window in seconds.
    pub health_check_window_secs: u64,
    /// Delay between health-check probes in milliseconds.
    pub health_check_interval_ms: u64,
    /// Per-app build budget in seconds; exceeding it kills the build.
    pub build_timeout_secs: u64,
    /// Clone/fetch attempts before a deploy fails.
    pub clone_attempts: u32,
    /// Extra non-code allowlist entries applied to every app.
    pub skip_build_paths: Vec<String>,
    /// Nginx vhost directory (sites-available).
    pub nginx_available_dir: PathBuf,
    /// Nginx enabled-vhost directory (sites-enabled).
    pub nginx_enabled_dir: PathBuf,
    /// Lines retained in the infrastructure log ring.
    pub infra_log_capacity: usize,
    /// Lines retained per app for `GET_LOGS`.
    pub app_log_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "ws://127.0.0.1:7700".to_owned(),
            state_dir: PathBuf::from("/var/lib/berth-agent"),
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            replay_window_secs: 300,
            handshake_timeout_secs: 30,
            health_check_window_secs: 30,
            health_check_interval_ms: 1_000,
            build_timeout_secs: 900,
            clone_attempts: 3,
            skip_build_paths: Vec::new(),
            nginx_available_dir: PathBuf::from("/etc/nginx/sites-available"),
            nginx_enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            infra_log_capacity: 2_000,
            app_log_capacity: 1_000,
        }
    }
}

impl AgentConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> AgentResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    /// The agent's identity key file.
    #[must_use]
    pub fn identity_key_path(&self) -> PathBuf {
        self.state_dir.join("identity.key")
    }

    /// The cached orchestrator public key file.
    #[must_use]
    pub fn orchestrator_key_path(&self) -> PathBuf {
        self.state_dir.join("orchestrator.pub")
    }

    /// Marker file recording the node ID assigned at registration.
    #[must_use]
    pub fn server_id_path(&self) -> PathBuf {
        self.state_dir.join("server_id")
    }

    /// Root of app working trees.
    #[must_use]
    pub fn apps_dir(&self) -> PathBuf {
        self.state_dir.join("apps")
    }

    /// The full agent-endpoint URL, appending the path when the
    /// configured URL is just a base.
    #[must_use]
    pub fn connect_url(&self) -> String {
        let base = self.orchestrator_url.trim_end_matches('/');
        if base.ends_with("/api/connect") {
            base.to_owned()
        } else {
            format!("{base}/api/connect")
        }
    }

    /// Replay window as a `Duration`.
    #[must_use]
    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }

    /// Handshake step timeout as a `Duration`.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// The version string reported in handshakes.
    #[must_use]
    pub fn agent_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
