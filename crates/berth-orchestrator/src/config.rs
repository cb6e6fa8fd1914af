//! Orchestrator configuration.
//!
//! Loaded from a TOML file when one is given; every field has a default so
//! `berthd` runs with no config file at all.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Runtime configuration for `berthd`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Address the WebSocket listener binds.
    pub listen_addr: SocketAddr,
    /// Directory for orchestrator state (signing key).
    pub state_dir: PathBuf,
    /// Per-step handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
    /// Registration token lifetime in minutes.
    pub token_ttl_minutes: i64,
    /// Per-agent outbound queue capacity (never-drop; full means stuck).
    pub agent_queue_capacity: usize,
    /// Per-dashboard outbound queue capacity for log-class frames.
    pub dashboard_queue_capacity: usize,
    /// Activity entries retained per owner.
    pub activity_capacity: usize,
    /// Activity entries included in `INITIAL_STATE`.
    pub initial_activity_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7700"
                .parse()
                .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 7700))),
            state_dir: PathBuf::from("/var/lib/berth"),
            handshake_timeout_secs: 30,
            token_ttl_minutes: 10,
            agent_queue_capacity: 64,
            dashboard_queue_capacity: 256,
            activity_capacity: 500,
            initial_activity_limit: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] if the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> OrchestratorResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("{}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))
    }

    /// Path of the orchestrator signing key file.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.state_dir.join("orchestrator.key")
    }

    /// Handshake timeout as a `Duration`.
    #[must_use]
    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Token lifetime as a chrono `Duration`.
    #[must_use]
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_ttl_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.handshake_timeout_secs, 30);
        assert_eq!(config.token_ttl_minutes, 10);
        assert!(config.key_path().ends_with("orchestrator.key"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berthd.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9000\"\n").unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.handshake_timeout_secs, 30);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berthd.toml");
        std::fs::write(&path, "listen_adr = \"127.0.0.1:9000\"\n").unwrap();
        assert!(OrchestratorConfig::load(&path).is_err());
    }
}
