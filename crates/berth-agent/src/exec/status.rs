//! Host status snapshot for `GET_SERVER_STATUS`.

use berth_proto::frames::{HostStats, RuntimeInfo, ServerStatusReport, ServiceInfo};

use crate::config::AgentConfig;
use crate::runner::capture_stdout;

/// Services reported in every snapshot.
const WATCHED_SERVICES: &[&str] = &["nginx", "postgresql", "mysql"];

/// Runtimes probed in every snapshot.
const RUNTIME_PROBES: &[(&str, &str, &[&str])] = &[
    ("node", "node", &["--version"]),
    ("python3", "python3", &["--version"]),
    ("go", "go", &["version"]),
    ("cargo", "cargo", &["--version"]),
];

/// Build the full snapshot: detected runtimes, databases, watched
/// services, and host stats from `/proc`.
pub(crate) async fn snapshot(_config: &AgentConfig) -> ServerStatusReport {
    let mut runtimes = Vec::new();
    for &(name, program, args) in RUNTIME_PROBES {
        if let Ok((status, output)) = capture_stdout(program, args).await {
            if status.success() && !output.is_empty() {
                runtimes.push(RuntimeInfo {
                    name: (*name).to_owned(),
                    version: output.lines().next().unwrap_or_default().to_owned(),
                });
            }
        }
    }

    let mut databases = Vec::new();
    if probe_ok("psql", &["--version"]).await {
        databases.push("postgres".to_owned());
    }
    if probe_ok("mysql", &["--version"]).await {
        databases.push("mysql".to_owned());
    }

    let mut services = Vec::new();
    for &service in WATCHED_SERVICES {
        let active = match capture_stdout("systemctl", &["is-active", service]).await {
            Ok((_, output)) => output == "active",
            Err(_) => false,
        };
        services.push(ServiceInfo {
            name: service.to_owned(),
            active,
        });
    }

    ServerStatusReport {
        agent_version: AgentConfig::agent_version().to_owned(),
        runtimes,
        databases,
        services,
        host: host_stats(),
    }
}

async fn probe_ok(program: &str, args: &[&str]) -> bool {
    matches!(capture_stdout(program, args).await, Ok((status, _)) if status.success())
}

/// Read host stats from `/proc`; zeroes on non-Linux hosts.
fn host_stats() -> HostStats {
    HostStats {
        load_avg: std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| parse_loadavg(&s))
            .unwrap_or(0.0),
        mem_total_kb: read_meminfo_field("MemTotal").unwrap_or(0),
        mem_available_kb: read_meminfo_field("MemAvailable").unwrap_or(0),
        uptime_secs: std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| parse_uptime(&s))
            .unwrap_or(0),
    }
}

/// First field of `/proc/loadavg`.
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Whole seconds from `/proc/uptime`.
fn parse_uptime(content: &str) -> Option<u64> {
    let seconds: f64 = content.split_whitespace().next()?.parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(seconds as u64)
    } else {
        None
    }
}

fn read_meminfo_field(field: &str) -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_field(&content, field)
}

/// `FieldName:    12345 kB` lines from `/proc/meminfo`.
fn parse_meminfo_field(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}
