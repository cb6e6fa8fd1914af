//! The deployment pipeline.
//!
//! Carries a `DEPLOY` from an idle working tree to a supervised,
//! traffic-serving process: clone/fetch (with retry), hot-path diffing
//! against the non-code allowlist, stack-detected build, supervised
//! start with port detection, health check, and a single rollback to the
//! anchor commit on failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth_core::AppId;
use berth_proto::frames::AgentFrame;
use berth_proto::{AppActionKind, DeployPhase, DeploySpec, LogStreamKind};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::exec::Executor;
use crate::runner::run_streaming;

/// Budget for a single git network operation.
const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of stderr kept for terminal failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Wait before sampling the started process for listening ports.
const PORT_DETECT_DELAY: Duration = Duration::from_millis(1_500);

// ── Paths and metadata ───────────────────────────────────────

pub(crate) struct AppPaths {
    pub repo: PathBuf,
    meta: PathBuf,
}

impl AppPaths {
    pub(crate) fn new(executor: &Executor, app_id: AppId) -> Self {
        let root = executor.config.apps_dir().join(app_id.to_string());
        Self {
            repo: root.join("repo"),
            meta: root.join("meta"),
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.meta.join(name))
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
    }

    fn write(&self, name: &str, value: &str) -> AgentResult<()> {
        std::fs::create_dir_all(&self.meta)?;
        std::fs::write(self.meta.join(name), value)?;
        Ok(())
    }

    pub(crate) fn serving_commit(&self) -> Option<String> {
        self.read("serving_commit")
    }

    fn built_commit(&self) -> Option<String> {
        self.read("built_commit")
    }

    fn save_spec(&self, spec: &DeploySpec) -> AgentResult<()> {
        self.write("spec.json", &serde_json::to_string(spec)?)
    }

    pub(crate) fn load_spec(&self) -> Option<DeploySpec> {
        serde_json::from_str(&self.read("spec.json")?).ok()
    }
}

// ── Pipeline ─────────────────────────────────────────────────

/// Run one deployment to a terminal phase.
pub(crate) async fn run_deploy(executor: &Arc<Executor>, spec: DeploySpec) {
    let app_id = spec.app_id;
    let paths = AppPaths::new(executor, app_id);

    // Duplicate webhook delivery: the requested commit is already
    // serving. Terminal build_skipped without touching git or spawning
    // anything.
    if let (Some(requested), Some(serving)) = (&spec.commit_hash, paths.serving_commit()) {
        if *requested == serving && executor.processes.is_running(app_id) {
            info!(app = %app_id, commit = %serving, "deploy is a no-op, commit already serving");
            emit(executor, app_id, DeployPhase::BuildSkipped, Some(serving), None).await;
            return;
        }
    }

    emit(executor, app_id, DeployPhase::Cloning, spec.commit_hash.clone(), None).await;
    let synced = match sync_repo(executor, &paths, &spec).await {
        Ok(synced) => synced,
        Err(e) => {
            warn!(app = %app_id, error = %e, "clone failed");
            emit(
                executor,
                app_id,
                DeployPhase::Failure,
                spec.commit_hash.clone(),
                Some(e.to_string()),
            )
            .await;
            return;
        },
    };
    let commit = synced.commit.clone();

    // Hot-path diffing: when every changed path since the last built
    // commit is non-code, skip the build entirely.
    let allowlist = effective_allowlist(&executor.config, &spec);
    let skip_build = match paths.built_commit() {
        Some(built) if built != commit => {
            match changed_paths(&paths.repo, &built, &commit).await {
                Ok(paths_changed) => only_non_code_paths(&paths_changed, &allowlist),
                Err(e) => {
                    debug!(app = %app_id, error = %e, "diff failed, building");
                    false
                },
            }
        },
        Some(_) => true, // same tree already built
        None => false,
    };

    if skip_build {
        info!(app = %app_id, commit = %commit, "hot path: non-code change, skipping build");
    } else {
        emit(executor, app_id, DeployPhase::Building, Some(commit.clone()), None).await;
        if let Err(tail) = build(executor, &paths, app_id).await {
            emit(
                executor,
                app_id,
                DeployPhase::Failure,
                Some(commit),
                Some(tail),
            )
            .await;
            return;
        }
        let _ = paths.write("built_commit", &commit);
    }

    emit(executor, app_id, DeployPhase::Starting, Some(commit.clone()), None).await;
    let _ = paths.save_spec(&spec);
    if let Err(e) = start_app(executor, &paths, &spec).await {
        warn!(app = %app_id, error = %e, "start failed");
        roll_back_or_fail(executor, &paths, &spec, &synced, &commit).await;
        return;
    }
    report_detected_ports(executor, app_id).await;

    emit(executor, app_id, DeployPhase::HealthCheck, Some(commit.clone()), None).await;
    if probe_health(&executor.config, &spec).await {
        let _ = paths.write("serving_commit", &commit);
        let terminal = if skip_build {
            DeployPhase::BuildSkipped
        } else {
            DeployPhase::Success
        };
        info!(app = %app_id, commit = %commit, "deploy succeeded");
        emit(executor, app_id, terminal, Some(commit), None).await;
    } else {
        warn!(app = %app_id, commit = %commit, "health check failed");
        roll_back_or_fail(executor, &paths, &spec, &synced, &commit).await;
    }
}

/// Enter rollback, restoring the anchor commit; a rollback that itself
/// fails is terminal failure with no second attempt.
async fn roll_back_or_fail(
    executor: &Arc<Executor>,
    paths: &AppPaths,
    spec: &DeploySpec,
    synced: &SyncedRepo,
    failed_commit: &str,
) {
    let app_id = spec.app_id;
    let Some(anchor) = synced.anchor.clone().filter(|a| a != failed_commit) else {
        emit(
            executor,
            app_id,
            DeployPhase::Failure,
            Some(failed_commit.to_owned()),
            Some("no rollback anchor available".to_owned()),
        )
        .await;
        return;
    };

    emit(
        executor,
        app_id,
        DeployPhase::Rollback,
        Some(failed_commit.to_owned()),
        Some(format!("rolling back to {anchor}")),
    )
    .await;

    match roll_back(executor, paths, spec, &anchor).await {
        Ok(()) => {
            let _ = paths.write("serving_commit", &anchor);
            emit(
                executor,
                app_id,
                DeployPhase::Success,
                Some(anchor.clone()),
                Some("rollback restored previous deployment".to_owned()),
            )
            .await;
            emit(
                executor,
                app_id,
                DeployPhase::Rollback,
                Some(failed_commit.to_owned()),
                None,
            )
            .await;
        },
        Err(e) => {
            warn!(app = %app_id, error = %e, "rollback failed");
            emit(
                executor,
                app_id,
                DeployPhase::Failure,
                Some(failed_commit.to_owned()),
                Some(format!("rollback failed: {e}")),
            )
            .await;
        },
    }
}

async fn roll_back(
    executor: &Arc<Executor>,
    paths: &AppPaths,
    spec: &DeploySpec,
    anchor: &str,
) -> AgentResult<()> {
    let app_id = spec.app_id;
    git_quiet(&paths.repo, &["checkout", "--force", anchor]).await?;

    if paths.built_commit().as_deref() != Some(anchor) {
        emit(executor, app_id, DeployPhase::Building, Some(anchor.to_owned()), None).await;
        build(executor, paths, app_id)
            .await
            .map_err(AgentError::Execution)?;
        paths.write("built_commit", anchor)?;
    }

    start_app(executor, paths, spec).await?;
    if !probe_health(&executor.config, spec).await {
        return Err(AgentError::Execution(
            "health check failed on rollback anchor".into(),
        ));
    }
    Ok(())
}

// ── Git ──────────────────────────────────────────────────────

pub(crate) struct SyncedRepo {
    /// The commit now checked out.
    pub commit: String,
    /// The commit serving before this run started (rollback anchor).
    pub anchor: Option<String>,
}

/// Create or update the working tree and check out the requested commit
/// (or branch tip). Network operations retry with linear backoff up to
/// the configured attempt count.
pub(crate) async fn sync_repo(
    executor: &Arc<Executor>,
    paths: &AppPaths,
    spec: &DeploySpec,
) -> AgentResult<SyncedRepo> {
    std::fs::create_dir_all(&paths.repo)?;
    let fresh_clone = !paths.repo.join(".git").exists();

    if fresh_clone {
        // `git clone .` needs an empty directory; wipe any partial tree
        // left by an interrupted earlier attempt.
        std::fs::remove_dir_all(&paths.repo)?;
        std::fs::create_dir_all(&paths.repo)?;
        git_network(
            executor,
            spec,
            &["clone", "--depth", "50", spec.repo_url.as_str(), "."],
        )
        .await?;
    } else {
        git_network(executor, spec, &["fetch", "--prune", "origin"]).await?;
    }

    let anchor = match paths.serving_commit() {
        Some(serving) => Some(serving),
        None if !fresh_clone => git_rev_parse(&paths.repo, "HEAD").await.ok(),
        None => None,
    };

    match spec.commit_hash.as_deref() {
        Some(commit) => {
            if git_quiet(&paths.repo, &["checkout", "--force", commit])
                .await
                .is_err()
            {
                // Shallow history may not contain the commit yet.
                git_network(executor, spec, &["fetch", "origin", commit]).await?;
                git_quiet(&paths.repo, &["checkout", "--force", commit]).await?;
            }
        },
        None => {
            let branch_ref = format!("origin/{}", spec.branch);
            git_quiet(&paths.repo, &["checkout", "--force", branch_ref.as_str()]).await?;
        },
    }

    let commit = git_rev_parse(&paths.repo, "HEAD").await?;
    Ok(SyncedRepo { commit, anchor })
}

/// Run a git network operation with retries, streaming its output.
async fn git_network(
    executor: &Arc<Executor>,
    spec: &DeploySpec,
    args: &[&str],
) -> AgentResult<()> {
    let paths = AppPaths::new(executor, spec.app_id);
    let attempts = executor.config.clone_attempts.max(1);
    let mut last_tail = String::new();

    for attempt in 1..=attempts {
        let mut tail = TailBuffer::new();
        let outbound = executor.outbound.clone();
        let app_id = spec.app_id;
        let status = run_streaming(
            "git",
            args,
            &paths.repo,
            &BTreeMap::new(),
            GIT_TIMEOUT,
            |stream, line| {
                tail.observe(stream, line);
                let _ = outbound.try_send(AgentFrame::LogStream {
                    app_id,
                    stream,
                    line: line.to_owned(),
                });
            },
        )
        .await?;

        if status.success() {
            return Ok(());
        }
        last_tail = tail.join();
        if attempt < attempts {
            debug!(app = %app_id, attempt, "git operation failed, retrying");
            tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
        }
    }
    Err(AgentError::Execution(format!(
        "git {} failed after {attempts} attempts: {last_tail}",
        args.first().unwrap_or(&"?")
    )))
}

async fn git_quiet(repo: &Path, args: &[&str]) -> AgentResult<()> {
    let status = run_streaming("git", args, repo, &BTreeMap::new(), GIT_TIMEOUT, |_, _| {}).await?;
    if status.success() {
        Ok(())
    } else {
        Err(AgentError::Execution(format!(
            "git {} failed",
            args.first().unwrap_or(&"?")
        )))
    }
}

async fn git_rev_parse(repo: &Path, rev: &str) -> AgentResult<String> {
    let mut commit = String::new();
    let status = run_streaming(
        "git",
        &["rev-parse", rev],
        repo,
        &BTreeMap::new(),
        GIT_TIMEOUT,
        |stream, line| {
            if stream == LogStreamKind::Stdout && commit.is_empty() {
                commit = line.to_owned();
            }
        },
    )
    .await?;
    if status.success() && !commit.is_empty() {
        Ok(commit)
    } else {
        Err(AgentError::Execution(format!("git rev-parse {rev} failed")))
    }
}

/// Paths changed between two commits.
pub(crate) async fn changed_paths(repo: &Path, from: &str, to: &str) -> AgentResult<Vec<String>> {
    let range = format!("{from}..{to}");
    let mut changed = Vec::new();
    let status = run_streaming(
        "git",
        &["diff", "--name-only", range.as_str()],
        repo,
        &BTreeMap::new(),
        GIT_TIMEOUT,
        |stream, line| {
            if stream == LogStreamKind::Stdout && !line.trim().is_empty() {
                changed.push(line.trim().to_owned());
            }
        },
    )
    .await?;
    if status.success() {
        Ok(changed)
    } else {
        Err(AgentError::Execution("git diff failed".into()))
    }
}

// ── Hot-path allowlist ───────────────────────────────────────

/// The app's allowlist: built-in defaults, agent-wide extras, per-app
/// entries.
pub(crate) fn effective_allowlist(
    config: &crate::config::AgentConfig,
    spec: &DeploySpec,
) -> Vec<String> {
    crate::config::DEFAULT_SKIP_BUILD_PATHS
        .iter()
        .map(|s| (*s).to_owned())
        .chain(config.skip_build_paths.iter().cloned())
        .chain(spec.skip_build_paths.iter().cloned())
        .collect()
}

/// Whether a path matches a single allowlist pattern.
///
/// `dir/` matches a directory prefix, `*.ext` an extension, `NAME*` a
/// file-name prefix, anything else an exact path.
pub(crate) fn path_is_non_code(path: &str, pattern: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        return path == dir || path.starts_with(pattern);
    }
    if let Some(ext) = pattern.strip_prefix("*.") {
        return Path::new(path)
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(prefix));
    }
    path == pattern
}

/// True when the diff is non-empty and every changed path is non-code.
pub(crate) fn only_non_code_paths(paths: &[String], allowlist: &[String]) -> bool {
    !paths.is_empty()
        && paths
            .iter()
            .all(|path| allowlist.iter().any(|pattern| path_is_non_code(path, pattern)))
}

// ── Build ────────────────────────────────────────────────────

/// Detected project stack, by manifest and lockfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stack {
    Bun,
    Pnpm,
    Yarn,
    Npm,
    Cargo,
    Go,
    Pip,
    Static,
}

pub(crate) fn detect_stack(dir: &Path) -> Stack {
    if dir.join("package.json").exists() {
        if dir.join("bun.lockb").exists() || dir.join("bun.lock").exists() {
            return Stack::Bun;
        }
        if dir.join("pnpm-lock.yaml").exists() {
            return Stack::Pnpm;
        }
        if dir.join("yarn.lock").exists() {
            return Stack::Yarn;
        }
        return Stack::Npm;
    }
    if dir.join("Cargo.toml").exists() {
        return Stack::Cargo;
    }
    if dir.join("go.mod").exists() {
        return Stack::Go;
    }
    if dir.join("requirements.txt").exists() {
        return Stack::Pip;
    }
    Stack::Static
}

/// Install-and-build command sequence for a stack.
pub(crate) fn build_steps(stack: Stack, dir: &Path) -> Vec<Vec<String>> {
    let own = |args: &[&str]| args.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
    match stack {
        Stack::Bun => {
            let mut steps = vec![own(&["bun", "install"])];
            if has_npm_script(dir, "build") {
                steps.push(own(&["bun", "run", "build"]));
            }
            steps
        },
        Stack::Pnpm => {
            let mut steps = vec![own(&["pnpm", "install", "--frozen-lockfile"])];
            if has_npm_script(dir, "build") {
                steps.push(own(&["pnpm", "run", "build"]));
            }
            steps
        },
        Stack::Yarn => {
            let mut steps = vec![own(&["yarn", "install", "--frozen-lockfile"])];
            if has_npm_script(dir, "build") {
                steps.push(own(&["yarn", "run", "build"]));
            }
            steps
        },
        Stack::Npm => {
            let install = if dir.join("package-lock.json").exists() {
                own(&["npm", "ci"])
            } else {
                own(&["npm", "install"])
            };
            let mut steps = vec![install];
            if has_npm_script(dir, "build") {
                steps.push(own(&["npm", "run", "build"]));
            }
            steps
        },
        Stack::Cargo => vec![own(&["cargo", "build", "--release"])],
        Stack::Go => vec![own(&["go", "build", "-o", ".berth-app", "."])],
        Stack::Pip => vec![own(&["pip3", "install", "-r", "requirements.txt"])],
        Stack::Static => Vec::new(),
    }
}

/// The supervised start command for a stack.
pub(crate) fn start_command(stack: Stack, dir: &Path, main_port: Option<u16>) -> Vec<String> {
    let own = |args: &[&str]| args.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
    match stack {
        Stack::Bun => own(&["bun", "start"]),
        Stack::Pnpm => own(&["pnpm", "start"]),
        Stack::Yarn => own(&["yarn", "start"]),
        Stack::Npm => own(&["npm", "start"]),
        Stack::Cargo => own(&["cargo", "run", "--release"]),
        Stack::Go => own(&["./.berth-app"]),
        Stack::Pip => {
            if dir.join("main.py").exists() {
                own(&["python3", "main.py"])
            } else {
                own(&["python3", "app.py"])
            }
        },
        Stack::Static => {
            let port = main_port.unwrap_or(8080).to_string();
            vec!["python3".into(), "-m".into(), "http.server".into(), port]
        },
    }
}

fn has_npm_script(dir: &Path, script: &str) -> bool {
    std::fs::read_to_string(dir.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|pkg| pkg.get("scripts")?.get(script).cloned())
        .is_some()
}

/// Run the stack's install + build steps, streaming every line. Returns
/// the captured stderr tail on failure.
async fn build(executor: &Arc<Executor>, paths: &AppPaths, app_id: AppId) -> Result<(), String> {
    let stack = detect_stack(&paths.repo);
    let budget = Duration::from_secs(executor.config.build_timeout_secs);

    for step in build_steps(stack, &paths.repo) {
        let args: Vec<&str> = step.iter().map(String::as_str).collect();
        let Some((&program, rest)) = args.split_first() else {
            continue;
        };
        let mut tail = TailBuffer::new();
        let outbound = executor.outbound.clone();
        let status = run_streaming(
            program,
            rest,
            &paths.repo,
            &BTreeMap::new(),
            budget,
            |stream, line| {
                tail.observe(stream, line);
                let _ = outbound.try_send(AgentFrame::LogStream {
                    app_id,
                    stream,
                    line: line.to_owned(),
                });
            },
        )
        .await
        .map_err(|e| e.to_string())?;

        if status.timed_out {
            return Err(format!("build exceeded {}s budget", budget.as_secs()));
        }
        if !status.success() {
            return Err(tail.join());
        }
    }
    Ok(())
}

/// Stop any running process for the app and start the new tree.
async fn start_app(
    executor: &Arc<Executor>,
    paths: &AppPaths,
    spec: &DeploySpec,
) -> AgentResult<()> {
    let app_id = spec.app_id;
    executor.processes.stop(app_id).await;

    let stack = detect_stack(&paths.repo);
    let main_port = spec.ports.iter().find(|p| p.main).map(|p| p.port);
    let command = start_command(stack, &paths.repo, main_port);
    let args: Vec<&str> = command.iter().map(String::as_str).collect();
    let (&program, rest) = args
        .split_first()
        .ok_or_else(|| AgentError::Execution("no start command for stack".into()))?;

    let mut env = spec.env.clone();
    if let Some(port) = main_port {
        env.entry("PORT".to_owned()).or_insert_with(|| port.to_string());
    }

    executor.processes.start(
        app_id,
        program,
        rest,
        paths.repo.clone(),
        &env,
        executor.outbound.clone(),
    )?;
    Ok(())
}

/// Sample the live process tree and report its listening ports.
async fn report_detected_ports(executor: &Arc<Executor>, app_id: AppId) {
    tokio::time::sleep(PORT_DETECT_DELAY).await;
    if let Some(pid) = executor.processes.pid(app_id) {
        let ports = crate::procreg::detect_listening_ports(pid);
        if !ports.is_empty() {
            executor
                .send(AgentFrame::DetectedPorts { app_id, ports })
                .await;
        }
    }
}

/// Probe the main port until it accepts or the window lapses.
pub(crate) async fn probe_health(config: &crate::config::AgentConfig, spec: &DeploySpec) -> bool {
    let Some(port) = spec.ports.iter().find(|p| p.main).map(|p| p.port) else {
        return true; // nothing to probe
    };
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.health_check_window_secs);
    let interval = Duration::from_millis(config.health_check_interval_ms);

    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

// ── App actions ──────────────────────────────────────────────

/// Run a start/stop/restart/delete action, serialized behind any deploy.
pub(crate) async fn run_action(executor: &Arc<Executor>, app_id: AppId, action: AppActionKind) {
    let paths = AppPaths::new(executor, app_id);
    let result: AgentResult<()> = match action {
        AppActionKind::Start => match paths.load_spec() {
            Some(spec) => start_app(executor, &paths, &spec).await,
            None => Err(AgentError::Execution("app has never been deployed".into())),
        },
        AppActionKind::Stop => {
            executor.processes.stop(app_id).await;
            Ok(())
        },
        AppActionKind::Restart => match paths.load_spec() {
            Some(spec) => start_app(executor, &paths, &spec).await,
            None => Err(AgentError::Execution("app has never been deployed".into())),
        },
        AppActionKind::Delete => {
            executor.processes.stop(app_id).await;
            let root = executor.config.apps_dir().join(app_id.to_string());
            match std::fs::remove_dir_all(&root) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        },
    };

    let (ok, message) = match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    executor
        .send(AgentFrame::AppActionResult {
            app_id,
            action,
            ok,
            message,
        })
        .await;
}

// ── Helpers ──────────────────────────────────────────────────

/// Keeps the last few stderr lines for terminal failure messages.
struct TailBuffer {
    lines: std::collections::VecDeque<String>,
}

impl TailBuffer {
    fn new() -> Self {
        Self {
            lines: std::collections::VecDeque::new(),
        }
    }

    fn observe(&mut self, stream: LogStreamKind, line: &str) {
        if stream == LogStreamKind::Stderr {
            if self.lines.len() >= STDERR_TAIL_LINES {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_owned());
        }
    }

    fn join(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

async fn emit(
    executor: &Arc<Executor>,
    app_id: AppId,
    phase: DeployPhase,
    commit_hash: Option<String>,
    message: Option<String>,
) {
    executor
        .send(AgentFrame::StatusUpdate {
            app_id,
            phase,
            commit_hash,
            message,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn allowlist_matches_extensions_dirs_and_prefixes() {
        assert!(path_is_non_code("README.md", "*.md"));
        assert!(path_is_non_code("docs/guide/intro.md", "docs/"));
        assert!(path_is_non_code("LICENSE-APACHE", "LICENSE*"));
        assert!(path_is_non_code(".github/workflows/ci.yml", ".github/"));

        assert!(!path_is_non_code("src/main.rs", "*.md"));
        assert!(!path_is_non_code("docstrings.py", "docs/"));
        assert!(!path_is_non_code("src/LICENSE-like.rs", "LICENSE*"));
    }

    #[test]
    fn hot_path_requires_every_changed_path_non_code() {
        let allowlist = owned(&["*.md", "docs/"]);
        assert!(only_non_code_paths(&owned(&["README.md"]), &allowlist));
        assert!(only_non_code_paths(
            &owned(&["README.md", "docs/api.txt"]),
            &owned(&["*.md", "docs/"]),
        ));
        assert!(!only_non_code_paths(
            &owned(&["README.md", "src/index.js"]),
            &allowlist,
        ));
        // An empty diff is not a hot-path skip; it is handled by the
        // built-commit check instead.
        assert!(!only_non_code_paths(&[], &allowlist));
    }

    #[test]
    fn stack_detection_prefers_lockfiles() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_stack(dir.path()), Stack::Static);

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_stack(dir.path()), Stack::Npm);

        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_stack(dir.path()), Stack::Yarn);

        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_stack(dir.path()), Stack::Pnpm);

        std::fs::write(dir.path().join("bun.lockb"), "").unwrap();
        assert_eq!(detect_stack(dir.path()), Stack::Bun);
    }

    #[test]
    fn npm_build_step_requires_a_build_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{\"scripts\":{\"start\":\"node .\"}}")
            .unwrap();
        let steps = build_steps(Stack::Npm, dir.path());
        assert_eq!(steps, vec![vec!["npm".to_owned(), "install".to_owned()]]);

        std::fs::write(
            dir.path().join("package.json"),
            "{\"scripts\":{\"build\":\"tsc\",\"start\":\"node .\"}}",
        )
        .unwrap();
        let steps = build_steps(Stack::Npm, dir.path());
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], vec!["npm", "run", "build"]);
    }

    #[test]
    fn lockfile_switches_npm_install_to_ci() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        let steps = build_steps(Stack::Npm, dir.path());
        assert_eq!(steps[0], vec!["npm", "ci"]);
    }

    #[tokio::test]
    async fn duplicate_deploy_of_serving_commit_is_a_no_op() {
        use crate::config::AgentConfig;
        use crate::identity::AgentIdentity;
        use crate::procreg::ProcessRegistry;
        use std::sync::Arc;
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig {
            state_dir: dir.path().to_path_buf(),
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

        let app_id = AppId::new();
        let spec = DeploySpec {
            app_id,
            repo_url: "https://git.example.com/site.git".into(),
            branch: "main".into(),
            commit_hash: Some("abc123".into()),
            env: BTreeMap::new(),
            ports: Vec::new(),
            skip_build_paths: Vec::new(),
        };

        // Precondition: abc123 is serving with a live supervised process.
        let paths = AppPaths::new(&executor, app_id);
        paths.write("serving_commit", "abc123").unwrap();
        executor
            .processes
            .start(
                app_id,
                "sh",
                &["-c", "sleep 30"],
                dir.path().to_path_buf(),
                &BTreeMap::new(),
                executor.outbound.clone(),
            )
            .unwrap();

        run_deploy(&executor, spec).await;

        // Exactly one frame: the terminal build_skipped. No cloning, no
        // building, no second process.
        let frame = out_rx.recv().await.unwrap();
        match frame {
            AgentFrame::StatusUpdate { phase, commit_hash, .. } => {
                assert_eq!(phase, DeployPhase::BuildSkipped);
                assert_eq!(commit_hash.as_deref(), Some("abc123"));
            },
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(out_rx.try_recv().is_err());

        executor.processes.stop(app_id).await;
    }

    #[tokio::test]
    async fn health_probe_succeeds_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = crate::config::AgentConfig {
            health_check_window_secs: 5,
            health_check_interval_ms: 50,
            ..crate::config::AgentConfig::default()
        };
        let spec = DeploySpec {
            app_id: AppId::new(),
            repo_url: String::new(),
            branch: "main".into(),
            commit_hash: None,
            env: BTreeMap::new(),
            ports: vec![berth_core::PortMapping { port, main: true }],
            skip_build_paths: Vec::new(),
        };
        assert!(probe_health(&config, &spec).await);
    }

    #[tokio::test]
    async fn health_probe_times_out_without_listener() {
        let config = crate::config::AgentConfig {
            health_check_window_secs: 1,
            health_check_interval_ms: 100,
            ..crate::config::AgentConfig::default()
        };
        let spec = DeploySpec {
            app_id: AppId::new(),
            repo_url: String::new(),
            branch: "main".into(),
            commit_hash: None,
            // Port 1 on loopback is essentially never bound.
            env: BTreeMap::new(),
            ports: vec![berth_core::PortMapping { port: 1, main: true }],
            skip_build_paths: Vec::new(),
        };
        assert!(!probe_health(&config, &spec).await);
    }
}
