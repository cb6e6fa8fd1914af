//! System service control and logs (systemd hosts).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_proto::frames::AgentFrame;
use berth_proto::{LogStreamKind, ServiceActionKind};
use tracing::{info, warn};

use crate::exec::Executor;
use crate::runner::{capture_stdout, run_streaming};

const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

fn verb(action: ServiceActionKind) -> &'static str {
    match action {
        ServiceActionKind::Start => "start",
        ServiceActionKind::Stop => "stop",
        ServiceActionKind::Restart => "restart",
        ServiceActionKind::Reload => "reload",
    }
}

/// Run `systemctl <action> <service>` and report the result.
pub(crate) async fn run_action(executor: &Arc<Executor>, service: &str, action: ServiceActionKind) {
    let op = format!("service_action:{service}");
    let mut stderr_tail = String::new();
    let cwd = std::env::temp_dir();

    let outcome = run_streaming(
        "systemctl",
        &[verb(action), service],
        &cwd,
        &BTreeMap::new(),
        SERVICE_TIMEOUT,
        |stream, line| {
            if stream == LogStreamKind::Stderr {
                stderr_tail = line.to_owned();
            }
        },
    )
    .await;

    let (ok, message) = match outcome {
        Ok(status) if status.success() => (true, None),
        Ok(_) => (false, Some(stderr_tail)),
        Err(e) => (false, Some(e.to_string())),
    };
    if ok {
        info!(%service, action = verb(action), "service action applied");
    } else {
        warn!(%service, action = verb(action), "service action failed");
    }
    executor.infra_line(&op, LogStreamKind::Stdout, &format!("systemctl {} {service}: {}", verb(action), if ok { "ok" } else { "failed" })).await;
    executor
        .send(AgentFrame::ServiceActionResult {
            service: service.to_owned(),
            action,
            ok,
            message,
        })
        .await;
}

/// Answer `GET_SERVICE_LOGS` with recent journal lines.
pub(crate) async fn send_logs(executor: &Arc<Executor>, service: &str, lines: u32) {
    let count = lines.to_string();
    let journal = capture_stdout(
        "journalctl",
        &["-u", service, "-n", &count, "--no-pager", "-o", "cat"],
    )
    .await;

    let lines = match journal {
        Ok((status, output)) if status.success() => {
            output.lines().map(str::to_owned).collect()
        },
        Ok(_) | Err(_) => Vec::new(),
    };
    executor
        .send(AgentFrame::ServiceLogsResponse {
            service: service.to_owned(),
            lines,
        })
        .await;
}
