//! Reverse-proxy provisioning.
//!
//! `PROVISION_DOMAIN` writes an nginx vhost, optionally acquires a TLS
//! certificate through certbot, validates the configuration, and reloads
//! nginx. Partial changes are reverted on any failure. `DELETE_PROXY` is
//! best-effort and treats an absent domain as a success no-op.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_proto::frames::AgentFrame;
use berth_proto::{LogStreamKind, ProvisionDomainSpec};
use tracing::{info, warn};

use crate::exec::Executor;
use crate::runner::run_streaming;

const PROXY_OP_TIMEOUT: Duration = Duration::from_secs(180);

/// Render the plain-HTTP vhost for a domain. Certbot rewrites it in
/// place when TLS is enabled.
pub(crate) fn render_vhost(domain: &str, port: u16) -> String {
    format!(
        "server {{\n\
         \x20   listen 80;\n\
         \x20   listen [::]:80;\n\
         \x20   server_name {domain};\n\
         \n\
         \x20   location / {{\n\
         \x20       proxy_pass http://127.0.0.1:{port};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Upgrade $http_upgrade;\n\
         \x20       proxy_set_header Connection \"upgrade\";\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20   }}\n\
         }}\n"
    )
}

fn vhost_paths(executor: &Executor, domain: &str) -> (PathBuf, PathBuf) {
    (
        executor.config.nginx_available_dir.join(domain),
        executor.config.nginx_enabled_dir.join(domain),
    )
}

/// Provision a domain, reverting partial changes on failure.
pub(crate) async fn provision(executor: &Arc<Executor>, spec: ProvisionDomainSpec) {
    let domain = spec.domain.clone();
    let op = format!("provision_domain:{domain}");

    match try_provision(executor, &spec, &op).await {
        Ok(()) => {
            info!(%domain, port = spec.port, ssl = spec.ssl, "domain provisioned");
            executor
                .send(AgentFrame::ProxyProvisioned {
                    domain,
                    port: spec.port,
                    ssl_enabled: spec.ssl,
                    app_id: spec.app_id,
                    ok: true,
                    message: None,
                })
                .await;
        },
        Err(message) => {
            warn!(%domain, %message, "domain provisioning failed, reverting");
            revert(executor, &domain).await;
            executor
                .send(AgentFrame::ProxyProvisioned {
                    domain,
                    port: spec.port,
                    ssl_enabled: false,
                    app_id: spec.app_id,
                    ok: false,
                    message: Some(message),
                })
                .await;
        },
    }
}

async fn try_provision(
    executor: &Arc<Executor>,
    spec: &ProvisionDomainSpec,
    op: &str,
) -> Result<(), String> {
    let (available, enabled) = vhost_paths(executor, &spec.domain);
    if let Some(parent) = available.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    if let Some(parent) = enabled.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    std::fs::write(&available, render_vhost(&spec.domain, spec.port))
        .map_err(|e| format!("write vhost: {e}"))?;
    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(&enabled);
        std::os::unix::fs::symlink(&available, &enabled)
            .map_err(|e| format!("enable vhost: {e}"))?;
    }

    run_proxy_step(executor, op, "nginx", &["-t"]).await?;

    if spec.ssl {
        run_proxy_step(
            executor,
            op,
            "certbot",
            &[
                "--nginx",
                "-d",
                &spec.domain,
                "--non-interactive",
                "--agree-tos",
                "--register-unsafely-without-email",
            ],
        )
        .await?;
    }

    run_proxy_step(executor, op, "nginx", &["-s", "reload"]).await
}

/// Remove the vhost and reload; absent files are fine.
pub(crate) async fn delete(executor: &Arc<Executor>, domain: &str) {
    let op = format!("delete_proxy:{domain}");
    let (available, enabled) = vhost_paths(executor, domain);
    let existed = available.exists() || enabled.exists();
    let _ = std::fs::remove_file(&enabled);
    let _ = std::fs::remove_file(&available);

    if existed {
        // Best-effort: report success even if the reload grumbles; the
        // vhost itself is gone.
        let _ = run_proxy_step(executor, &op, "nginx", &["-s", "reload"]).await;
        let _ = run_proxy_step(
            executor,
            &op,
            "certbot",
            &["delete", "--cert-name", domain, "--non-interactive"],
        )
        .await;
    }

    info!(%domain, existed, "proxy deleted");
    executor
        .send(AgentFrame::ProxyDeleted {
            domain: domain.to_owned(),
            ok: true,
        })
        .await;
}

/// Remove whatever a failed provisioning attempt left behind.
async fn revert(executor: &Arc<Executor>, domain: &str) {
    let (available, enabled) = vhost_paths(executor, domain);
    let _ = std::fs::remove_file(&enabled);
    let _ = std::fs::remove_file(&available);
    let op = format!("provision_domain:{domain}");
    let _ = run_proxy_step(executor, &op, "nginx", &["-s", "reload"]).await;
}

/// Run one proxy-related command, streaming output as infrastructure
/// log lines.
async fn run_proxy_step(
    executor: &Arc<Executor>,
    op: &str,
    program: &str,
    args: &[&str],
) -> Result<(), String> {
    let cwd = std::env::temp_dir();
    let mut stderr_tail = String::new();
    let lines: std::sync::Mutex<Vec<(LogStreamKind, String)>> = std::sync::Mutex::new(Vec::new());
    let status = run_streaming(program, args, &cwd, &BTreeMap::new(), PROXY_OP_TIMEOUT, {
        let lines = &lines;
        move |stream, line| {
            if let Ok(mut buffered) = lines.lock() {
                buffered.push((stream, line.to_owned()));
            }
        }
    })
    .await
    .map_err(|e| e.to_string())?;

    if let Ok(buffered) = lines.into_inner() {
        for (stream, line) in buffered {
            if stream == LogStreamKind::Stderr {
                stderr_tail = line.clone();
            }
            executor.infra_line(op, stream, &line).await;
        }
    }

    if status.success() {
        Ok(())
    } else {
        Err(format!("{program} {} failed: {stderr_tail}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::identity::AgentIdentity;
    use crate::procreg::ProcessRegistry;
    use berth_proto::frames::AgentFrame;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn deleting_an_absent_domain_is_a_success_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig {
            state_dir: dir.path().to_path_buf(),
            nginx_available_dir: dir.path().join("sites-available"),
            nginx_enabled_dir: dir.path().join("sites-enabled"),
            ..AgentConfig::default()
        });
        let identity = Arc::new(AgentIdentity::load_or_generate(&config).unwrap());
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let (ctrl_tx, _ctrl_rx) = mpsc::channel(8);
        let executor = crate::exec::Executor::new(
            config,
            out_tx,
            ProcessRegistry::new(64),
            identity,
            ctrl_tx,
        );

        delete(&executor, "ghost.example.com").await;

        let frame = out_rx.recv().await.unwrap();
        match frame {
            AgentFrame::ProxyDeleted { domain, ok } => {
                assert_eq!(domain, "ghost.example.com");
                assert!(ok);
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn vhost_renders_domain_and_upstream() {
        let vhost = render_vhost("app.example.com", 3000);
        assert!(vhost.contains("server_name app.example.com;"));
        assert!(vhost.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(vhost.contains("listen 80;"));
        // Websocket upgrade headers are part of the default template.
        assert!(vhost.contains("proxy_set_header Upgrade"));
    }
}
