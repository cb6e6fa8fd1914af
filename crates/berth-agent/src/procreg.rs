//! Supervised app processes.
//!
//! One supervised child per app, owner-scoped by the app's working
//! directory. Output lines stream to the session outbound channel (tagged
//! with their stream) and into a per-app ring for `GET_LOGS`. Stop is
//! SIGTERM first, SIGKILL after a grace period. Listening ports of the
//! live process tree are detected from `/proc`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_core::AppId;
use berth_proto::frames::AgentFrame;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::logbuf::LogRing;
use crate::runner::StreamingChild;

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Supervised {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: tokio::sync::watch::Receiver<bool>,
}

/// Registry of supervised app processes.
pub struct ProcessRegistry {
    running: Mutex<HashMap<AppId, Supervised>>,
    logs: Mutex<HashMap<AppId, Arc<LogRing>>>,
    log_capacity: usize,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            log_capacity,
        })
    }

    /// The app's log ring (created on first use).
    #[must_use]
    pub fn app_log(&self, app_id: AppId) -> Arc<LogRing> {
        let Ok(mut logs) = self.logs.lock() else {
            return Arc::new(LogRing::new(self.log_capacity));
        };
        Arc::clone(
            logs.entry(app_id)
                .or_insert_with(|| Arc::new(LogRing::new(self.log_capacity))),
        )
    }

    /// Whether the app's process is currently supervised and alive.
    #[must_use]
    pub fn is_running(&self, app_id: AppId) -> bool {
        self.running
            .lock()
            .map(|running| {
                running
                    .get(&app_id)
                    .is_some_and(|entry| !*entry.done_rx.borrow())
            })
            .unwrap_or(false)
    }

    /// The supervised process ID, while running.
    #[must_use]
    pub fn pid(&self, app_id: AppId) -> Option<u32> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(&app_id).and_then(|entry| entry.pid))
    }

    /// Start supervising `program` for an app.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Process`] if the app already runs or the
    /// program cannot be spawned.
    pub fn start(
        self: &Arc<Self>,
        app_id: AppId,
        program: &str,
        args: &[&str],
        cwd: PathBuf,
        envs: &std::collections::BTreeMap<String, String>,
        outbound: mpsc::Sender<AgentFrame>,
    ) -> AgentResult<u32> {
        if self.is_running(app_id) {
            return Err(AgentError::Process(format!(
                "app {app_id} already has a supervised process"
            )));
        }

        let child = StreamingChild::spawn(program, args, &cwd, envs)?;
        let pid = child
            .pid()
            .ok_or_else(|| AgentError::Process("child exited before supervision".into()))?;
        let ring = self.app_log(app_id);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);

        if let Ok(mut running) = self.running.lock() {
            running.insert(
                app_id,
                Supervised {
                    pid: Some(pid),
                    stop_tx: Some(stop_tx),
                    done_rx,
                },
            );
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            supervise(app_id, child, ring, outbound, stop_rx).await;
            let _ = done_tx.send(true);
            if let Ok(mut running) = registry.running.lock() {
                // A replacement may already be supervised; only remove our
                // own generation.
                if running
                    .get(&app_id)
                    .is_some_and(|entry| *entry.done_rx.borrow())
                {
                    running.remove(&app_id);
                }
            }
        });

        info!(app = %app_id, pid, %program, "app process supervised");
        Ok(pid)
    }

    /// Stop the app's process (SIGTERM, then SIGKILL after the grace
    /// period). Returns `false` if nothing was running.
    pub async fn stop(&self, app_id: AppId) -> bool {
        let (stop_tx, mut done_rx) = {
            let Ok(mut running) = self.running.lock() else {
                return false;
            };
            let Some(entry) = running.get_mut(&app_id) else {
                return false;
            };
            (entry.stop_tx.take(), entry.done_rx.clone())
        };
        let Some(stop_tx) = stop_tx else {
            return false;
        };
        let _ = stop_tx.send(());
        // Wait for the supervision task to finish its shutdown sequence.
        let _ = tokio::time::timeout(
            STOP_GRACE.saturating_add(Duration::from_secs(5)),
            done_rx.wait_for(|done| *done),
        )
        .await;
        if let Ok(mut running) = self.running.lock() {
            running.remove(&app_id);
        }
        true
    }
}

/// Pump output lines and react to the stop signal.
async fn supervise(
    app_id: AppId,
    mut child: StreamingChild,
    ring: Arc<LogRing>,
    outbound: mpsc::Sender<AgentFrame>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let pid = child.pid();
    let mut stopped = false;
    loop {
        tokio::select! {
            line = child.next_line() => {
                match line {
                    Some((stream, line)) => {
                        ring.push(line.clone());
                        // Dropped when the session is down or slow; the
                        // ring still serves GET_LOGS.
                        let _ = outbound.try_send(AgentFrame::LogStream {
                            app_id,
                            stream,
                            line,
                        });
                    },
                    None => break,
                }
            },
            _ = &mut stop_rx => {
                stopped = true;
                graceful_stop(&mut child, pid).await;
                break;
            },
        }
    }

    match child.wait().await {
        Ok(status) if !stopped && !status.success() => {
            warn!(app = %app_id, code = status.exit_code, "app process exited unexpectedly");
            let _ = outbound.try_send(AgentFrame::SystemLog {
                level: "warn".into(),
                message: format!("app {app_id} exited with code {}", status.exit_code),
            });
        },
        Ok(_) => {},
        Err(e) => debug!(app = %app_id, error = %e, "wait failed"),
    }
}

/// SIGTERM, grace period, then SIGKILL.
async fn graceful_stop(child: &mut StreamingChild, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Ok(raw) = i32::try_from(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(raw),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        // Drain remaining output until the child exits or the grace
        // period lapses.
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::timeout_at(deadline, child.next_line())
            .await
            .ok()
            .flatten()
            .is_some()
        {}
    }
    child.kill().await;
}

// ── /proc port detection ─────────────────────────────────────

/// Detect TCP ports the process tree rooted at `root_pid` listens on.
///
/// Reads `/proc/net/tcp{,6}` and matches socket inodes against the file
/// descriptors of the root process and its descendants. Returns an empty
/// list on non-Linux hosts.
#[must_use]
pub fn detect_listening_ports(root_pid: u32) -> Vec<u16> {
    let pids = descendant_pids(root_pid);
    let inodes = socket_inodes(&pids);
    if inodes.is_empty() {
        return Vec::new();
    }

    let mut ports = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            ports.extend(listening_ports_in_table(&content, &inodes));
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// `root_pid` plus every live descendant, via `/proc/*/stat` ppid links.
fn descendant_pids(root_pid: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_stat_ppid(&stat) {
                children.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut result = vec![root_pid];
    let mut cursor = 0;
    while cursor < result.len() {
        let pid = result[cursor];
        cursor = cursor.saturating_add(1);
        if let Some(kids) = children.get(&pid) {
            result.extend(kids.iter().copied());
        }
    }
    result
}

/// The ppid field of `/proc/<pid>/stat` (field 4, after the comm which may
/// itself contain spaces and parentheses).
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')?..];
    after_comm.split_whitespace().nth(2)?.parse().ok()
}

/// Socket inodes held by any of `pids`.
fn socket_inodes(pids: &[u32]) -> HashSet<u64> {
    let mut inodes = HashSet::new();
    for pid in pids {
        let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|inode| inode.parse().ok())
            {
                inodes.insert(inode);
            }
        }
    }
    inodes
}

/// Ports in LISTEN state (`st == 0A`) whose inode is in `inodes`.
fn listening_ports_in_table(table: &str, inodes: &HashSet<u64>) -> Vec<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode: u64 = fields.get(9)?.parse().ok()?;
            if *state != "0A" || !inodes.contains(&inode) {
                return None;
            }
            let port_hex = local.rsplit(':').next()?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_ppid_past_comm_with_spaces() {
        let stat = "123 (my app (v2)) S 77 123 123 0 -1 4194560";
        assert_eq!(parse_stat_ppid(stat), Some(77));
    }

    #[test]
    fn finds_listening_ports_by_inode() {
        // 0BB8 = 3000; one LISTEN row matching, one ESTABLISHED, one
        // LISTEN with a foreign inode.
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4242 1
   1: 0100007F:0BB9 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 4243 1
   2: 00000000:1F40 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 9999 1";
        let inodes: HashSet<u64> = [4242, 4243].into_iter().collect();
        assert_eq!(listening_ports_in_table(table, &inodes), vec![3000]);
    }

    #[tokio::test]
    async fn start_stream_stop_lifecycle() {
        let registry = ProcessRegistry::new(64);
        let dir = tempfile::tempdir().unwrap();
        let app_id = AppId::new();
        let (tx, mut rx) = mpsc::channel(64);

        registry
            .start(
                app_id,
                "sh",
                &["-c", "echo serving; sleep 30"],
                dir.path().to_path_buf(),
                &BTreeMap::new(),
                tx,
            )
            .unwrap();
        assert!(registry.is_running(app_id));

        // The output line arrives as a LOG_STREAM frame and in the ring.
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            AgentFrame::LogStream { app_id: a, .. } if a == app_id
        ));
        assert_eq!(registry.app_log(app_id).recent(10), vec!["serving"]);

        assert!(registry.stop(app_id).await);
        assert!(!registry.is_running(app_id));
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let registry = ProcessRegistry::new(64);
        let dir = tempfile::tempdir().unwrap();
        let app_id = AppId::new();
        let (tx, _rx) = mpsc::channel(64);

        registry
            .start(
                app_id,
                "sh",
                &["-c", "sleep 30"],
                dir.path().to_path_buf(),
                &BTreeMap::new(),
                tx.clone(),
            )
            .unwrap();
        let second = registry.start(
            app_id,
            "sh",
            &["-c", "sleep 30"],
            dir.path().to_path_buf(),
            &BTreeMap::new(),
            tx,
        );
        assert!(second.is_err());
        registry.stop(app_id).await;
    }

    #[tokio::test]
    async fn stop_without_process_is_false() {
        let registry = ProcessRegistry::new(64);
        assert!(!registry.stop(AppId::new()).await);
    }
}
