//! Toolchain runtime management (apt-based hosts).
//!
//! Install/update/remove stream their package-manager output as
//! `INFRASTRUCTURE_LOG` frames and finish with a terminal `RUNTIME_*`
//! report carrying the detected version.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_proto::RuntimeSpec;
use berth_proto::frames::AgentFrame;
use tracing::{info, warn};

use crate::exec::Executor;
use crate::runner::{capture_stdout, run_streaming};

const PACKAGE_TIMEOUT: Duration = Duration::from_secs(900);

/// Map a runtime name to the apt packages providing it.
pub(crate) fn packages_for(runtime: &str) -> Vec<&'static str> {
    match runtime {
        "node" | "nodejs" => vec!["nodejs", "npm"],
        "python" | "python3" => vec!["python3", "python3-pip", "python3-venv"],
        "go" | "golang" => vec!["golang-go"],
        "rust" | "cargo" => vec!["cargo"],
        "ruby" => vec!["ruby-full"],
        "php" => vec!["php-cli", "php-fpm"],
        _ => Vec::new(),
    }
}

/// The binary probed for a version string after the operation.
fn version_probe(runtime: &str) -> Option<(&'static str, &'static [&'static str])> {
    match runtime {
        "node" | "nodejs" => Some(("node", &["--version"])),
        "python" | "python3" => Some(("python3", &["--version"])),
        "go" | "golang" => Some(("go", &["version"])),
        "rust" | "cargo" => Some(("cargo", &["--version"])),
        "ruby" => Some(("ruby", &["--version"])),
        "php" => Some(("php", &["--version"])),
        _ => None,
    }
}

pub(crate) async fn install(executor: &Arc<Executor>, spec: RuntimeSpec) {
    let ok = apt(executor, &spec, "install_runtime", &["install", "-y"]).await;
    let version = detect_version(&spec.runtime).await;
    info!(runtime = %spec.runtime, ok, "runtime install finished");
    executor
        .send(AgentFrame::RuntimeInstalled {
            runtime: spec.runtime,
            version,
            ok,
        })
        .await;
}

pub(crate) async fn update(executor: &Arc<Executor>, spec: RuntimeSpec) {
    let ok = apt(
        executor,
        &spec,
        "update_runtime",
        &["install", "--only-upgrade", "-y"],
    )
    .await;
    let version = detect_version(&spec.runtime).await;
    info!(runtime = %spec.runtime, ok, "runtime update finished");
    executor
        .send(AgentFrame::RuntimeUpdated {
            runtime: spec.runtime,
            version,
            ok,
        })
        .await;
}

pub(crate) async fn remove(executor: &Arc<Executor>, spec: RuntimeSpec) {
    let ok = apt(executor, &spec, "remove_runtime", &["remove", "-y"]).await;
    info!(runtime = %spec.runtime, ok, "runtime removal finished");
    executor
        .send(AgentFrame::RuntimeRemoved {
            runtime: spec.runtime,
            ok,
        })
        .await;
}

/// Run one apt-get operation over the runtime's packages, streaming
/// output into the infrastructure log.
async fn apt(executor: &Arc<Executor>, spec: &RuntimeSpec, op_name: &str, verb: &[&str]) -> bool {
    let packages = packages_for(&spec.runtime);
    if packages.is_empty() {
        warn!(runtime = %spec.runtime, "unknown runtime");
        executor
            .infra_line(
                &format!("{op_name}:{}", spec.runtime),
                berth_proto::LogStreamKind::Stderr,
                &format!("unknown runtime: {}", spec.runtime),
            )
            .await;
        return false;
    }

    let op = format!("{op_name}:{}", spec.runtime);
    let mut args: Vec<&str> = Vec::with_capacity(verb.len().saturating_add(packages.len()));
    args.extend_from_slice(verb);
    args.extend_from_slice(&packages);

    let cwd = std::env::temp_dir();
    let env: BTreeMap<String, String> =
        [("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned())].into();

    let lines = std::sync::Mutex::new(Vec::new());
    let outcome = run_streaming("apt-get", &args, &cwd, &env, PACKAGE_TIMEOUT, |stream, line| {
        if let Ok(mut buffered) = lines.lock() {
            buffered.push((stream, line.to_owned()));
        }
    })
    .await;

    if let Ok(buffered) = lines.into_inner() {
        for (stream, line) in buffered {
            executor.infra_line(&op, stream, &line).await;
        }
    }
    matches!(outcome, Ok(status) if status.success())
}

async fn detect_version(runtime: &str) -> Option<String> {
    let (program, args) = version_probe(runtime)?;
    match capture_stdout(program, args).await {
        Ok((status, output)) if status.success() && !output.is_empty() => {
            Some(output.lines().next().unwrap_or_default().to_owned())
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_runtimes_have_packages_and_probes() {
        for runtime in ["node", "python3", "golang", "cargo", "ruby", "php"] {
            assert!(!packages_for(runtime).is_empty(), "{runtime}");
            assert!(version_probe(runtime).is_some(), "{runtime}");
        }
    }

    #[test]
    fn unknown_runtime_is_empty() {
        assert!(packages_for("cobol").is_empty());
        assert!(version_probe("cobol").is_none());
    }
}
