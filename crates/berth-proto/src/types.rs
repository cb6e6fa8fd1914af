//! Small shared wire enums.

use serde::{Deserialize, Serialize};

/// Phase of one deployment run, emitted as `STATUS_UPDATE` frames.
///
/// `Success`, `Rollback`, `Failure`, and `BuildSkipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployPhase {
    /// Creating or updating the working tree.
    #[serde(rename = "cloning")]
    Cloning,
    /// Running the detected install + build step.
    #[serde(rename = "building")]
    Building,
    /// Starting the supervised process.
    #[serde(rename = "starting")]
    Starting,
    /// Probing the main port.
    #[serde(rename = "health-check")]
    HealthCheck,
    /// Terminal: the new commit is serving.
    #[serde(rename = "success")]
    Success,
    /// Terminal: health check failed and the rollback anchor is serving.
    #[serde(rename = "rollback")]
    Rollback,
    /// Terminal: the run (or its rollback) failed.
    #[serde(rename = "failure")]
    Failure,
    /// Terminal: only non-code paths changed, no build performed.
    #[serde(rename = "build_skipped")]
    BuildSkipped,
}

impl DeployPhase {
    /// Whether this phase ends the run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Rollback | Self::Failure | Self::BuildSkipped
        )
    }
}

/// Which stream of a child process a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Lifecycle action on a supervised app process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppActionKind {
    /// Start the process from the last built tree.
    Start,
    /// Stop the process.
    Stop,
    /// Stop then start.
    Restart,
    /// Stop and remove the working directory.
    Delete,
}

/// Action on a system service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceActionKind {
    /// `systemctl start`.
    Start,
    /// `systemctl stop`.
    Stop,
    /// `systemctl restart`.
    Restart,
    /// `systemctl reload`.
    Reload,
}

/// Database engines the agent can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    /// PostgreSQL via `psql`.
    Postgres,
    /// MySQL / MariaDB via `mysql`.
    Mysql,
}

impl DatabaseEngine {
    /// Default loopback port for the engine.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }
}

/// Phase of an agent self-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentUpdatePhase {
    /// Fetching the new bundle.
    Downloading,
    /// Replacing the installed bundle (old one kept as backup).
    Swapping,
    /// Restarting into the new version.
    Restarting,
    /// Terminal: update applied.
    Complete,
    /// Terminal: update failed, prior bundle still installed.
    Failed,
}

/// How the agent should shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Stop the agent service, leave the install in place.
    Stop,
    /// Stop and purge the install.
    Uninstall,
}

/// Outcome tag carried on report frames and activity entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Operation completed.
    Success,
    /// Operation failed.
    Failure,
    /// Informational.
    Info,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wire_names_match_protocol() {
        assert_eq!(
            serde_json::to_string(&DeployPhase::HealthCheck).unwrap(),
            "\"health-check\""
        );
        assert_eq!(
            serde_json::to_string(&DeployPhase::BuildSkipped).unwrap(),
            "\"build_skipped\""
        );
    }

    #[test]
    fn terminal_phases() {
        assert!(DeployPhase::Success.is_terminal());
        assert!(DeployPhase::BuildSkipped.is_terminal());
        assert!(!DeployPhase::Cloning.is_terminal());
        assert!(!DeployPhase::HealthCheck.is_terminal());
    }
}
