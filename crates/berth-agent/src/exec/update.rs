//! Agent self-update, shutdown, and identity regeneration.

use std::path::PathBuf;
use std::sync::Arc;

use berth_proto::frames::AgentFrame;
use berth_proto::{AgentUpdatePhase, ShutdownMode, UpdateAgentSpec};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::exec::{ControlSignal, Executor};

/// Download the new bundle, back up the running binary, swap, and exit so
/// the service manager restarts into the new version.
pub(crate) async fn run(executor: &Arc<Executor>, spec: UpdateAgentSpec) {
    let version = spec.version.clone();
    emit_status(executor, AgentUpdatePhase::Downloading, &version, None).await;

    match try_update(executor, &spec).await {
        Ok(()) => {
            emit_status(executor, AgentUpdatePhase::Restarting, &version, None).await;
            emit_status(executor, AgentUpdatePhase::Complete, &version, None).await;
            info!(%version, "agent updated, restarting");
            let _ = executor.control.send(ControlSignal::Shutdown).await;
        },
        Err(message) => {
            warn!(%version, %message, "agent update failed");
            emit_status(executor, AgentUpdatePhase::Failed, &version, Some(message)).await;
        },
    }
}

async fn try_update(executor: &Arc<Executor>, spec: &UpdateAgentSpec) -> Result<(), String> {
    let response = reqwest::get(&spec.bundle_url)
        .await
        .map_err(|e| format!("download: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("download: HTTP {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| format!("download: {e}"))?;
    log_line(executor, format!("downloaded {} bytes", bytes.len())).await;

    if let Some(expected) = &spec.checksum {
        let actual = hex::encode(Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            ));
        }
        log_line(executor, "checksum verified".to_owned()).await;
    }

    let current = std::env::current_exe().map_err(|e| format!("current_exe: {e}"))?;
    let staged = staged_path(executor);
    if let Some(parent) = staged.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&staged, &bytes).map_err(|e| format!("stage: {e}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| e.to_string())?;
    }

    emit_status(
        executor,
        AgentUpdatePhase::Swapping,
        &spec.version,
        None,
    )
    .await;

    // Keep the prior bundle so a bad update can be rolled back by hand.
    let backup = current.with_extension("bak");
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(&current, &backup).map_err(|e| format!("backup: {e}"))?;
    if let Err(e) = std::fs::rename(&staged, &current) {
        // Restore the old binary before reporting failure.
        let _ = std::fs::rename(&backup, &current);
        return Err(format!("swap: {e}"));
    }
    log_line(executor, format!("previous bundle kept at {}", backup.display())).await;
    Ok(())
}

fn staged_path(executor: &Executor) -> PathBuf {
    executor.config.state_dir.join("update").join("agent.new")
}

/// Acknowledge and stop (optionally purging the install).
pub(crate) async fn shutdown(executor: &Arc<Executor>, mode: ShutdownMode) {
    info!(?mode, "shutdown requested");
    executor.send(AgentFrame::AgentShutdownAck { mode }).await;

    if mode == ShutdownMode::Uninstall {
        // Purge app trees and identity; the binary removes itself last,
        // best-effort.
        let _ = std::fs::remove_dir_all(&executor.config.state_dir);
        if let Ok(current) = std::env::current_exe() {
            let _ = std::fs::remove_file(current);
        }
    }
    let _ = executor.control.send(ControlSignal::Shutdown).await;
}

/// Mint a fresh identity keypair and reconnect with it.
pub(crate) async fn regenerate_identity(executor: &Arc<Executor>) {
    match executor.identity.regenerate() {
        Ok(public_key) => {
            executor
                .send(AgentFrame::SystemLog {
                    level: "info".into(),
                    message: format!(
                        "identity regenerated, new key {}",
                        public_key.short_id()
                    ),
                })
                .await;
            let _ = executor.control.send(ControlSignal::Reconnect).await;
        },
        Err(e) => {
            warn!(error = %e, "identity regeneration failed");
            executor
                .send(AgentFrame::SystemLog {
                    level: "error".into(),
                    message: format!("identity regeneration failed: {e}"),
                })
                .await;
        },
    }
}

async fn emit_status(
    executor: &Arc<Executor>,
    phase: AgentUpdatePhase,
    version: &str,
    message: Option<String>,
) {
    executor
        .send(AgentFrame::AgentUpdateStatus {
            phase,
            version: version.to_owned(),
            message,
        })
        .await;
}

async fn log_line(executor: &Arc<Executor>, line: String) {
    executor.send(AgentFrame::AgentUpdateLog { line }).await;
}
