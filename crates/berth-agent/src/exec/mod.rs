//! Signed-command receivers.
//!
//! [`Executor::dispatch`] fans each verified command out to its handler;
//! every in-flight command runs on its own task. Deploys and app actions
//! are serialized per app through a worker mailbox: at most one run at a
//! time, a second deploy queues at depth one (newer collapses older), and
//! actions queue behind the running deploy.

pub mod database;
pub mod deploy;
pub mod proxy;
pub mod runtime;
pub mod service;
pub mod status;
pub mod update;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use berth_core::AppId;
use berth_proto::frames::AgentFrame;
use berth_proto::{AppActionKind, Command, DeploySpec, LogStreamKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::identity::AgentIdentity;
use crate::logbuf::LogRing;
use crate::procreg::ProcessRegistry;

/// Signals from the executor back to the session supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Drop the current session and reconnect (identity regenerated,
    /// stuck session recovery).
    Reconnect,
    /// Exit the agent process (shutdown, or restart-into-new-binary via
    /// the service manager).
    Shutdown,
}

enum AppJob {
    /// Marker: pull the newest pending deploy spec and run it.
    Deploy,
    Action(AppActionKind),
}

struct AppWorker {
    jobs: mpsc::Sender<AppJob>,
    pending_deploy: Arc<Mutex<Option<DeploySpec>>>,
}

/// Executes verified commands on the host.
pub struct Executor {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) outbound: mpsc::Sender<AgentFrame>,
    pub(crate) processes: Arc<ProcessRegistry>,
    pub(crate) infra_log: Arc<LogRing>,
    pub(crate) identity: Arc<AgentIdentity>,
    pub(crate) control: mpsc::Sender<ControlSignal>,
    workers: Mutex<HashMap<AppId, AppWorker>>,
}

impl Executor {
    /// Assemble the executor.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        outbound: mpsc::Sender<AgentFrame>,
        processes: Arc<ProcessRegistry>,
        identity: Arc<AgentIdentity>,
        control: mpsc::Sender<ControlSignal>,
    ) -> Arc<Self> {
        let infra_log = Arc::new(LogRing::new(config.infra_log_capacity));
        Arc::new(Self {
            config,
            outbound,
            processes,
            infra_log,
            identity,
            control,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Route one verified command to its handler.
    ///
    /// Returns immediately; the work runs on its own task (or the app's
    /// worker task for deploys and app actions).
    pub fn dispatch(self: &Arc<Self>, command: Command) {
        debug!(kind = %command.type_name(), "dispatching command");
        match command {
            Command::Deploy(spec) => self.enqueue_deploy(spec),
            Command::AppAction { app_id, action } => self.enqueue_action(app_id, action),

            Command::ProvisionDomain(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { proxy::provision(&executor, spec).await });
            },
            Command::DeleteProxy { domain } => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { proxy::delete(&executor, &domain).await });
            },
            Command::ServiceAction { service, action } => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { service::run_action(&executor, &service, action).await });
            },
            Command::GetLogs { app_id, lines } => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { executor.send_app_logs(app_id, lines).await });
            },

            Command::InstallRuntime(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { runtime::install(&executor, spec).await });
            },
            Command::UpdateRuntime(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { runtime::update(&executor, spec).await });
            },
            Command::RemoveRuntime(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { runtime::remove(&executor, spec).await });
            },

            Command::ConfigureDatabase(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { database::configure(&executor, spec, false).await });
            },
            Command::ReconfigureDatabase(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { database::configure(&executor, spec, true).await });
            },
            Command::RemoveDatabase(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { database::remove(&executor, spec).await });
            },

            Command::GetServerStatus => {
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    let report = status::snapshot(&executor.config).await;
                    executor
                        .send(AgentFrame::ServerStatusResponse { status: report })
                        .await;
                });
            },
            Command::GetInfrastructureLogs { lines } => {
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    let lines = executor.infra_log.recent(lines as usize);
                    executor
                        .send(AgentFrame::InfrastructureLogsResponse { lines })
                        .await;
                });
            },
            Command::ClearInfrastructureLogs => {
                self.infra_log.clear();
            },
            Command::GetServiceLogs { service, lines } => {
                let executor = Arc::clone(self);
                tokio::spawn(
                    async move { service::send_logs(&executor, &service, lines).await },
                );
            },

            Command::UpdateAgent(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { update::run(&executor, spec).await });
            },
            Command::ShutdownAgent(spec) => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { update::shutdown(&executor, spec.mode).await });
            },
            Command::RegenerateIdentity => {
                let executor = Arc::clone(self);
                tokio::spawn(async move { update::regenerate_identity(&executor).await });
            },

            // Handled inline by the session, before dispatch.
            Command::CpKeyRotation { .. } => {},
        }
    }

    /// Queue a deploy on the app's worker, collapsing to the newest spec.
    fn enqueue_deploy(self: &Arc<Self>, spec: DeploySpec) {
        let app_id = spec.app_id;
        let worker = self.worker(app_id);
        let had_pending = {
            let Ok(mut pending) = worker.pending_deploy.lock() else {
                return;
            };
            let had = pending.is_some();
            *pending = Some(spec);
            had
        };
        if had_pending {
            debug!(app = %app_id, "deploy collapsed into pending run");
            return;
        }
        let jobs = worker.jobs.clone();
        tokio::spawn(async move {
            if jobs.send(AppJob::Deploy).await.is_err() {
                warn!(app = %app_id, "app worker gone, deploy dropped");
            }
        });
    }

    /// Queue an app action behind whatever the worker is doing.
    fn enqueue_action(self: &Arc<Self>, app_id: AppId, action: AppActionKind) {
        let worker = self.worker(app_id);
        let jobs = worker.jobs.clone();
        tokio::spawn(async move {
            if jobs.send(AppJob::Action(action)).await.is_err() {
                warn!(app = %app_id, "app worker gone, action dropped");
            }
        });
    }

    fn worker(self: &Arc<Self>, app_id: AppId) -> AppWorker {
        let Ok(mut workers) = self.workers.lock() else {
            // Unreachable in practice; return a detached worker.
            let (jobs, _rx) = mpsc::channel(1);
            return AppWorker {
                jobs,
                pending_deploy: Arc::new(Mutex::new(None)),
            };
        };
        let worker = workers.entry(app_id).or_insert_with(|| {
            let (jobs, rx) = mpsc::channel(32);
            let pending_deploy = Arc::new(Mutex::new(None));
            let executor = Arc::clone(self);
            tokio::spawn(worker_loop(
                executor,
                app_id,
                rx,
                Arc::clone(&pending_deploy),
            ));
            AppWorker {
                jobs,
                pending_deploy,
            }
        });
        AppWorker {
            jobs: worker.jobs.clone(),
            pending_deploy: Arc::clone(&worker.pending_deploy),
        }
    }

    /// Reply to `GET_LOGS` from the app's ring.
    async fn send_app_logs(&self, app_id: AppId, lines: u32) {
        for line in self.processes.app_log(app_id).recent(lines as usize) {
            self.send(AgentFrame::LogStream {
                app_id,
                stream: LogStreamKind::Stdout,
                line,
            })
            .await;
        }
    }

    /// Send a frame, logging (not failing) when the session is down.
    pub(crate) async fn send(&self, frame: AgentFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!("outbound channel closed, frame dropped");
        }
    }

    /// Record an infrastructure log line and mirror it to dashboards.
    pub(crate) async fn infra_line(&self, operation: &str, stream: LogStreamKind, line: &str) {
        self.infra_log.push(format!("[{operation}] {line}"));
        self.send(AgentFrame::InfrastructureLog {
            operation: operation.to_owned(),
            stream,
            line: line.to_owned(),
        })
        .await;
    }
}

/// One app's serialized job loop.
async fn worker_loop(
    executor: Arc<Executor>,
    app_id: AppId,
    mut jobs: mpsc::Receiver<AppJob>,
    pending_deploy: Arc<Mutex<Option<DeploySpec>>>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            AppJob::Deploy => {
                let spec = pending_deploy.lock().ok().and_then(|mut slot| slot.take());
                if let Some(spec) = spec {
                    deploy::run_deploy(&executor, spec).await;
                }
            },
            AppJob::Action(action) => {
                deploy::run_action(&executor, app_id, action).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn executor() -> (Arc<Executor>, mpsc::Receiver<AgentFrame>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig {
            state_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        });
        let identity = Arc::new(AgentIdentity::load_or_generate(&config).unwrap());
        let (out_tx, out_rx) = mpsc::channel(256);
        let (ctrl_tx, _ctrl_rx) = mpsc::channel(8);
        let processes = ProcessRegistry::new(64);
        (
            Executor::new(config, out_tx, processes, identity, ctrl_tx),
            out_rx,
            dir,
        )
    }

    #[tokio::test]
    async fn pending_deploy_collapses_to_newest() {
        let (executor, _rx, _dir) = executor();
        let app_id = AppId::new();
        let spec = |commit: &str| DeploySpec {
            app_id,
            repo_url: "https://git.example.com/site.git".into(),
            branch: "main".into(),
            commit_hash: Some(commit.into()),
            env: BTreeMap::new(),
            ports: Vec::new(),
            skip_build_paths: Vec::new(),
        };

        // Fill the pending slot twice before any worker runs.
        let worker = executor.worker(app_id);
        {
            let mut pending = worker.pending_deploy.lock().unwrap();
            *pending = Some(spec("old"));
            *pending = Some(spec("new"));
        }
        let taken = worker.pending_deploy.lock().unwrap().take().unwrap();
        assert_eq!(taken.commit_hash.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn infrastructure_log_ring_answers_get_logs() {
        let (executor, mut rx, _dir) = executor();
        executor
            .infra_line("install_runtime:node", LogStreamKind::Stdout, "unpacking")
            .await;

        // Mirrored live...
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, AgentFrame::InfrastructureLog { .. }));

        // ...and retained for GET_INFRASTRUCTURE_LOGS.
        executor.dispatch(Command::GetInfrastructureLogs { lines: 10 });
        let frame = rx.recv().await.unwrap();
        match frame {
            AgentFrame::InfrastructureLogsResponse { lines } => {
                assert_eq!(lines, vec!["[install_runtime:node] unpacking"]);
            },
            other => panic!("unexpected frame: {other:?}"),
        }

        // CLEAR empties the ring.
        executor.dispatch(Command::ClearInfrastructureLogs);
        executor.dispatch(Command::GetInfrastructureLogs { lines: 10 });
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            AgentFrame::InfrastructureLogsResponse { lines } if lines.is_empty()
        ));
    }
}
