//! Child-process execution with line-streamed output.
//!
//! The deploy pipeline and the infrastructure receivers consume child
//! output as a finite sequence of `(stream, line)` pairs; nothing here
//! knows about WebSockets or frames.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use berth_proto::LogStreamKind;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Outcome of a completed (or killed) child process.
#[derive(Debug)]
pub struct RunStatus {
    /// Exit code; `-1` when killed by signal or timeout.
    pub exit_code: i32,
    /// Whether the run was killed for exceeding its budget.
    pub timed_out: bool,
}

impl RunStatus {
    /// Whether the child exited zero within its budget.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// A spawned child whose stdout/stderr arrive as tagged lines.
pub struct StreamingChild {
    child: Child,
    lines: mpsc::Receiver<(LogStreamKind, String)>,
}

impl StreamingChild {
    /// Spawn `program` with `args` in `cwd`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Process`] if the program cannot be spawned.
    pub fn spawn(
        program: &str,
        args: &[&str],
        cwd: &Path,
        envs: &BTreeMap<String, String>,
    ) -> AgentResult<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Process(format!("spawn {program}: {e}")))?;

        let (tx, lines) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, LogStreamKind::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, LogStreamKind::Stderr, tx);
        }

        Ok(Self { child, lines })
    }

    /// Next output line, or `None` once both streams are exhausted.
    pub async fn next_line(&mut self) -> Option<(LogStreamKind, String)> {
        self.lines.recv().await
    }

    /// The OS process ID, while the child runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Process`] if waiting fails.
    pub async fn wait(mut self) -> AgentResult<RunStatus> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| AgentError::Process(e.to_string()))?;
        Ok(RunStatus {
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        })
    }

    /// Kill the child immediately.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

fn pump_lines<R>(reader: R, kind: LogStreamKind, tx: mpsc::Sender<(LogStreamKind, String)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((kind, line)).await.is_err() {
                break;
            }
        }
    });
}

/// Run a command to completion, feeding every output line to `on_line`,
/// within `budget`. On timeout the child is killed and `timed_out` set.
///
/// # Errors
///
/// Returns [`AgentError::Process`] if the program cannot be spawned or
/// waited on; a non-zero exit is reported in the status, not as an error.
pub async fn run_streaming<F>(
    program: &str,
    args: &[&str],
    cwd: &Path,
    envs: &BTreeMap<String, String>,
    budget: Duration,
    mut on_line: F,
) -> AgentResult<RunStatus>
where
    F: FnMut(LogStreamKind, &str),
{
    let mut child = StreamingChild::spawn(program, args, cwd, envs)?;
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        match tokio::time::timeout_at(deadline, child.next_line()).await {
            Ok(Some((kind, line))) => on_line(kind, &line),
            Ok(None) => break,
            Err(_) => {
                debug!(%program, "budget exceeded, killing child");
                child.kill().await;
                return Ok(RunStatus {
                    exit_code: -1,
                    timed_out: true,
                });
            },
        }
    }

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status,
        Err(_) => Ok(RunStatus {
            exit_code: -1,
            timed_out: true,
        }),
    }
}

/// Run a command quietly and capture stdout (for version probes).
///
/// # Errors
///
/// Returns [`AgentError::Process`] on spawn failure.
pub async fn capture_stdout(program: &str, args: &[&str]) -> AgentResult<(RunStatus, String)> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AgentError::Process(format!("spawn {program}: {e}")))?;
    Ok((
        RunStatus {
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        },
        String::from_utf8_lossy(&output.stdout).trim().to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr_with_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        let status = run_streaming(
            "sh",
            &["-c", "echo out-line; echo err-line >&2"],
            dir.path(),
            &no_env(),
            Duration::from_secs(10),
            |kind, line| seen.push((kind, line.to_owned())),
        )
        .await
        .unwrap();

        assert!(status.success());
        assert!(seen.contains(&(LogStreamKind::Stdout, "out-line".to_owned())));
        assert!(seen.contains(&(LogStreamKind::Stderr, "err-line".to_owned())));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let status = run_streaming(
            "sh",
            &["-c", "exit 3"],
            dir.path(),
            &no_env(),
            Duration::from_secs(10),
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(status.exit_code, 3);
        assert!(!status.success());
    }

    #[tokio::test]
    async fn budget_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let status = run_streaming(
            "sh",
            &["-c", "sleep 30"],
            dir.path(),
            &no_env(),
            Duration::from_millis(200),
            |_, _| {},
        )
        .await
        .unwrap();

        assert!(status.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_a_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_streaming(
            "definitely-not-a-real-binary",
            &[],
            dir.path(),
            &no_env(),
            Duration::from_secs(1),
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(AgentError::Process(_))));
    }

    #[tokio::test]
    async fn capture_stdout_trims() {
        let (status, out) = capture_stdout("sh", &["-c", "echo hello"]).await.unwrap();
        assert!(status.success());
        assert_eq!(out, "hello");
    }
}
