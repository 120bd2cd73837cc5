//! Session lifecycle dispatch over execution mode and transport.
//!
//! Every operation matches [`SessionKind`] exhaustively. The registry is
//! consulted (never cached) before a session moves into `running`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use super::liveness::HostLiveness;
use super::signals::SignalStore;
use super::supervisor::{pid_alive, signal_group, signal_process, ProcessSignal};
use crate::config::GlobalConfig;
use crate::models::session::{
    ExecutionMode, OverlayInfo, ServerInfo, SessionKind, SessionRecord, SessionStatus,
};
use crate::models::signal::SignalKind;
use crate::multiplexer::{DetachedSession, Multiplexer};
use crate::overlay::remote::{connect_remote, RemoteDaemonClient, StartSessionParams};
use crate::overlay::OverlayNetwork;
use crate::persistence::session_repo::SessionRegistry;
use crate::{AppError, Result};

/// Environment variable carrying the multiplexer session name into the
/// driver running inside it.
pub const SESSION_ENV: &str = "AGENT_LOOP_SESSION";

/// Request to start a terminal-mode session.
#[derive(Debug, Clone)]
pub struct TerminalStart {
    /// Task name.
    pub task_name: String,
    /// Task directory; also the working directory of the driver.
    pub task_dir: PathBuf,
    /// Agent identifier.
    pub agent: String,
    /// Iteration cap.
    pub max_iterations: u32,
    /// Shell command running the loop driver.
    pub command: String,
    /// Extra environment for the driver.
    pub env: BTreeMap<String, String>,
}

/// Where `attach` should connect the caller's terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Local multiplexer session.
    Terminal {
        /// Multiplexer session name.
        session_name: String,
    },
    /// Local agent server.
    AgentServer {
        /// Base URL.
        url: String,
        /// Agent session to resume, if known.
        agent_session_id: Option<String>,
    },
    /// Agent server behind a remote proxy service.
    Remote {
        /// Proxy service to forward to.
        service_name: String,
        /// Identity used to dial it.
        identity_path: PathBuf,
        /// Agent session to resume, if known.
        agent_session_id: Option<String>,
    },
    /// Multiplexer session on a remote host, reached over ssh.
    RemoteTerminal {
        /// Remote host.
        host: String,
        /// Multiplexer session name on that host.
        session_name: String,
    },
}

/// Overlay settings needed to reach remote daemons.
#[derive(Debug, Clone)]
pub struct RemoteAccess {
    /// Overlay provider.
    pub network: Arc<dyn OverlayNetwork>,
    /// Prefix of every host's control service.
    pub control_service_prefix: String,
    /// Identity used when a record does not name one.
    pub default_identity: Option<PathBuf>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Status reported for one overlay session by `refresh_remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    /// Task name.
    pub task_name: String,
    /// Reconciled status, `None` if the daemon could not be reached.
    pub status: Option<SessionStatus>,
}

/// Start, stop, inspect, and attach to sessions of every kind.
pub struct SessionLifecycle {
    registry: SessionRegistry,
    multiplexer: Arc<dyn Multiplexer>,
    liveness: HostLiveness,
    signals: SignalStore,
    terminal_size: (u16, u16),
    sockets_dir: PathBuf,
    remote: Option<RemoteAccess>,
}

impl SessionLifecycle {
    /// Lifecycle over `registry` using `multiplexer` for terminal sessions.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        registry: SessionRegistry,
        multiplexer: Arc<dyn Multiplexer>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            registry,
            liveness: HostLiveness::new(
                Arc::clone(&multiplexer),
                http,
                config.timeouts.health_probe(),
            ),
            multiplexer,
            signals: SignalStore::new(config.signals_dir()),
            terminal_size: (config.multiplexer.width, config.multiplexer.height),
            sockets_dir: config.sockets_dir(),
            remote: None,
        }
    }

    /// Enable operations on overlay sessions.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteAccess) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Registry backing this lifecycle.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Signal files used by local sessions.
    #[must_use]
    pub fn signals(&self) -> &SignalStore {
        &self.signals
    }

    /// Fail if `task_name` has a `running` record that is still alive.
    /// A stale `running` record is demoted to `failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionAlreadyRunning` for a live session.
    pub async fn ensure_startable(&self, task_name: &str) -> Result<()> {
        let Some(existing) = self.registry.get(task_name).await? else {
            return Ok(());
        };
        if !existing.is_running() {
            return Ok(());
        }
        let reconciled = self
            .registry
            .reconcile_liveness(existing, &self.liveness)
            .await?;
        if reconciled.is_running() {
            return Err(AppError::SessionAlreadyRunning(task_name.to_owned()));
        }
        info!(task_name, "stale running record demoted, start proceeds");
        Ok(())
    }

    /// Start the loop driver inside a detached multiplexer session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionAlreadyRunning` if the task is live,
    /// `AppError::Multiplexer` if the session cannot be created, or the
    /// registry error; a created session is killed again if the record
    /// cannot be claimed.
    pub async fn start_terminal_session(&self, request: TerminalStart) -> Result<SessionRecord> {
        let span = info_span!("start_terminal_session", task_name = %request.task_name);
        async {
            self.ensure_startable(&request.task_name).await?;

            let name = self.multiplexer.session_name(&request.task_name);
            if self.multiplexer.session_exists(&name).await {
                warn!(session = %name, "killing stale multiplexer session");
                self.multiplexer.kill_session(&name).await;
            }

            let mut env = request.env.clone();
            env.insert(SESSION_ENV.to_owned(), name.clone());
            let pid = self
                .multiplexer
                .create_detached_session(DetachedSession {
                    name: name.clone(),
                    command: request.command.clone(),
                    cwd: request.task_dir.clone(),
                    env,
                    width: self.terminal_size.0,
                    height: self.terminal_size.1,
                })
                .await?;

            let mut record = SessionRecord::new(
                &request.task_name,
                request.task_dir.to_string_lossy(),
                &request.agent,
                ExecutionMode::Terminal,
                request.max_iterations,
            );
            record.worker_pid = Some(pid);

            if let Err(err) = self.registry.claim_running(&record).await {
                self.multiplexer.kill_session(&name).await;
                return Err(err);
            }
            self.signals.clear(&request.task_name);
            info!(session = %name, pid, "terminal session started");
            Ok(record)
        }
        .instrument(span)
        .await
    }

    /// Start a session on a remote daemon and record it locally as an
    /// overlay session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` without overlay access, the remote
    /// error if the daemon refuses, or `AppError::SessionAlreadyRunning`.
    pub async fn start_remote_session(
        &self,
        host: &str,
        params: &StartSessionParams,
    ) -> Result<SessionRecord> {
        self.ensure_startable(&params.task_name).await?;
        let remote = self.remote_access()?;
        let identity = remote.default_identity.clone().ok_or_else(|| {
            AppError::Config("overlay.identity_path is not configured".into())
        })?;
        let client = self.connect_host(host, &identity).await?;
        let started = client.start_session(params).await?;

        let record = SessionRecord::new(
            &params.task_name,
            &params.task_dir,
            &params.agent,
            ExecutionMode::AgentServer,
            u32::try_from(params.max_iterations).unwrap_or(0),
        )
        .with_server(ServerInfo {
            port: Some(started.port),
            url: None,
            agent_session_id: started.agent_session_id,
        })
        .with_overlay(OverlayInfo {
            service_name: started.service_name,
            identity_path: Some(identity.to_string_lossy().into_owned()),
            remote_host: Some(host.to_owned()),
        });

        if let Err(err) = self.registry.claim_running(&record).await {
            if let Err(stop_err) = client.stop_session(&params.task_name).await {
                warn!(task_name = %params.task_name, %stop_err, "remote rollback failed");
            }
            return Err(err);
        }
        info!(task_name = %params.task_name, host, "remote session started");
        Ok(record)
    }

    /// Ask a running session to stop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task, `AppError::Session`
    /// if it is not running, or the remote error for overlay sessions.
    pub async fn stop(&self, task_name: &str) -> Result<SessionRecord> {
        let record = self.running_record(task_name).await?;
        match record.kind() {
            SessionKind::LocalTerminal => {
                self.signals.write(task_name, SignalKind::Stop)?;
                if let Some(pid) = record.worker_pid {
                    signal_process(pid, ProcessSignal::Interrupt);
                }
                info!(task_name, "stop signal sent");
            }
            SessionKind::LocalAgentServer => {
                if let Some(pid) = record.worker_pid {
                    terminate_worker(pid);
                }
                self.registry
                    .update_status(task_name, SessionStatus::Stopped)
                    .await?;
                info!(task_name, "agent server stopped");
            }
            SessionKind::OverlayTerminal | SessionKind::OverlayAgentServer => {
                self.remote_client(&record).await?.stop_session(task_name).await?;
                self.registry
                    .update_status(task_name, SessionStatus::Stopped)
                    .await?;
                info!(task_name, "remote session stopped");
            }
        }
        self.require(task_name).await
    }

    /// Ask a running session to checkpoint after its current iteration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task, `AppError::Session`
    /// if it is not running, or the remote error for overlay sessions.
    pub async fn checkpoint(&self, task_name: &str) -> Result<()> {
        let record = self.running_record(task_name).await?;
        match record.kind() {
            SessionKind::LocalTerminal | SessionKind::LocalAgentServer => {
                self.signals.write(task_name, SignalKind::Checkpoint)?;
            }
            SessionKind::OverlayTerminal | SessionKind::OverlayAgentServer => {
                self.remote_client(&record)
                    .await?
                    .checkpoint_session(task_name)
                    .await?;
            }
        }
        info!(task_name, "checkpoint requested");
        Ok(())
    }

    /// Tear down local resources of a finished session and record its final
    /// status. Unknown tasks are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the status update fails.
    pub async fn cleanup(&self, task_name: &str, status: SessionStatus) -> Result<()> {
        let Some(record) = self.registry.get(task_name).await? else {
            return Ok(());
        };
        match record.kind() {
            SessionKind::LocalTerminal => {
                let name = self.multiplexer.session_name(task_name);
                if self.multiplexer.session_exists(&name).await {
                    self.multiplexer.kill_session(&name).await;
                }
            }
            SessionKind::LocalAgentServer => {
                if let Some(pid) = record.worker_pid {
                    terminate_worker(pid);
                }
            }
            SessionKind::OverlayTerminal | SessionKind::OverlayAgentServer => {}
        }
        self.registry.update_status(task_name, status).await?;
        if record.kind().is_local() {
            self.signals.clear(task_name);
        }
        Ok(())
    }

    /// Every record, with running local records reconciled against live
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read.
    pub async fn status(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for record in self.registry.list_all().await? {
            records.push(
                self.registry
                    .reconcile_liveness(record, &self.liveness)
                    .await?,
            );
        }
        Ok(records)
    }

    /// One record, reconciled like [`Self::status`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read or updated.
    pub async fn reconciled(&self, task_name: &str) -> Result<Option<SessionRecord>> {
        match self.registry.get(task_name).await? {
            Some(record) => Ok(Some(
                self.registry
                    .reconcile_liveness(record, &self.liveness)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    /// Query each running overlay session's daemon and apply its answer.
    /// A task the daemon no longer knows is marked `failed`; an unreachable
    /// daemon leaves the record untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read or updated.
    pub async fn refresh_remote(&self) -> Result<Vec<RemoteStatus>> {
        let mut report = Vec::new();
        for record in self.registry.list_remote().await? {
            if !record.is_running() {
                report.push(RemoteStatus {
                    task_name: record.task_name.clone(),
                    status: Some(record.status),
                });
                continue;
            }
            let answer = match self.remote_client(&record).await {
                Ok(client) => client.session_status(&record.task_name).await,
                Err(err) => Err(err),
            };
            let status = match answer {
                Ok(reported) => {
                    let reported = reported.unwrap_or(SessionStatus::Failed);
                    self.registry
                        .reconcile_remote(&record.task_name, reported)
                        .await?
                        .map(|r| r.status)
                }
                Err(err) => {
                    warn!(task_name = %record.task_name, %err, "remote daemon unreachable");
                    None
                }
            };
            report.push(RemoteStatus {
                task_name: record.task_name,
                status,
            });
        }
        Ok(report)
    }

    /// Resolve how to attach to `task_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task and
    /// `AppError::Session` when the session cannot be attached; a local
    /// session found dead is marked `failed` first.
    pub async fn attach(&self, task_name: &str) -> Result<AttachTarget> {
        let record = self.require(task_name).await?;
        match record.kind() {
            SessionKind::LocalTerminal => {
                let session_name = self.multiplexer.session_name(task_name);
                if !self.multiplexer.session_exists(&session_name).await {
                    if record.is_running() {
                        self.registry
                            .update_status(task_name, SessionStatus::Failed)
                            .await?;
                    }
                    return Err(AppError::Session(format!(
                        "session '{task_name}' is no longer running (multiplexer session gone, last status: {})",
                        record.status.as_str()
                    )));
                }
                if !self.multiplexer.pane_alive(&session_name).await {
                    return Err(AppError::Session(format!(
                        "session '{task_name}' process has exited; its pane output is kept in multiplexer session {session_name}"
                    )));
                }
                Ok(AttachTarget::Terminal { session_name })
            }
            SessionKind::LocalAgentServer => {
                let Some(port) = record.server.port else {
                    return Err(AppError::Session(format!(
                        "session '{task_name}' has no server port recorded"
                    )));
                };
                if !self.liveness.server_alive(Some(port)).await {
                    self.registry
                        .update_status(task_name, SessionStatus::Failed)
                        .await?;
                    return Err(AppError::Session(format!(
                        "agent server for '{task_name}' is not responding (port {port})"
                    )));
                }
                Ok(AttachTarget::AgentServer {
                    url: record
                        .server
                        .url
                        .clone()
                        .unwrap_or_else(|| format!("http://localhost:{port}")),
                    agent_session_id: record.server.agent_session_id.clone(),
                })
            }
            SessionKind::OverlayAgentServer => {
                let service_name = record.overlay.service_name.clone().ok_or_else(|| {
                    AppError::Session(format!(
                        "remote session '{task_name}' has no proxy service recorded"
                    ))
                })?;
                let identity_path = self.identity_for(&record)?;
                Ok(AttachTarget::Remote {
                    service_name,
                    identity_path,
                    agent_session_id: record.server.agent_session_id.clone(),
                })
            }
            SessionKind::OverlayTerminal => {
                let host = record.overlay.remote_host.clone().ok_or_else(|| {
                    AppError::Session(format!(
                        "remote session '{task_name}' has no remote host recorded"
                    ))
                })?;
                Ok(AttachTarget::RemoteTerminal {
                    host,
                    session_name: self.multiplexer.session_name(task_name),
                })
            }
        }
    }

    /// Remove non-running records (every record with `all`) together with
    /// their multiplexer sessions, sockets, and signal files. Returns the
    /// removed task names.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read or updated.
    pub async fn clean(&self, all: bool) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for record in self.status().await? {
            if record.is_running() && !all {
                continue;
            }
            let task = record.task_name.as_str();
            match record.kind() {
                SessionKind::LocalTerminal => {
                    let name = self.multiplexer.session_name(task);
                    if self.multiplexer.session_exists(&name).await {
                        self.multiplexer.kill_session(&name).await;
                    }
                }
                SessionKind::LocalAgentServer => {
                    if let (true, Some(pid)) = (record.is_running(), record.worker_pid) {
                        terminate_worker(pid);
                    }
                }
                SessionKind::OverlayTerminal | SessionKind::OverlayAgentServer => {}
            }
            self.registry.remove(task).await?;
            self.signals.clear(task);
            remove_socket(&self.sockets_dir.join(format!("{task}.sock")));
            removed.push(record.task_name);
        }
        info!(count = removed.len(), "sessions cleaned");
        Ok(removed)
    }

    async fn require(&self, task_name: &str) -> Result<SessionRecord> {
        self.registry
            .get(task_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no session found for task '{task_name}'")))
    }

    async fn running_record(&self, task_name: &str) -> Result<SessionRecord> {
        let record = self.require(task_name).await?;
        if !record.is_running() {
            return Err(AppError::Session(format!(
                "session '{task_name}' is not running (status: {})",
                record.status.as_str()
            )));
        }
        Ok(record)
    }

    fn remote_access(&self) -> Result<&RemoteAccess> {
        self.remote
            .as_ref()
            .ok_or_else(|| AppError::Config("overlay access is not configured".into()))
    }

    fn identity_for(&self, record: &SessionRecord) -> Result<PathBuf> {
        record
            .overlay
            .identity_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.remote.as_ref().and_then(|r| r.default_identity.clone()))
            .ok_or_else(|| {
                AppError::Config(format!(
                    "no overlay identity for remote session '{}'",
                    record.task_name
                ))
            })
    }

    async fn connect_host(&self, host: &str, identity: &std::path::Path) -> Result<RemoteDaemonClient> {
        let remote = self.remote_access()?;
        let service = format!("{}{host}", remote.control_service_prefix);
        connect_remote(remote.network.as_ref(), identity, &service, remote.timeout).await
    }

    async fn remote_client(&self, record: &SessionRecord) -> Result<RemoteDaemonClient> {
        let host = record.overlay.remote_host.as_deref().ok_or_else(|| {
            AppError::Session(format!(
                "remote session '{}' has no remote host recorded",
                record.task_name
            ))
        })?;
        let identity = self.identity_for(record)?;
        self.connect_host(host, &identity).await
    }
}

fn terminate_worker(pid: u32) {
    signal_group(pid, ProcessSignal::Terminate);
    if pid_alive(pid) {
        signal_process(pid, ProcessSignal::Terminate);
    }
}

fn remove_socket(path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to remove socket");
        }
    }
}
