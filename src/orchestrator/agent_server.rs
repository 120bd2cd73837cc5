//! Agent-server instance manager.
//!
//! Owns one HTTP agent-server process per session id: allocates its port,
//! launches it through the [`ProcessSupervisor`], waits for health, and
//! tears it down with abort, SIGTERM, and SIGKILL escalation. A start that
//! fails or is abandoned releases its port and its in-progress mark.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use futures_util::future::join_all;
use tracing::{error, info, info_span, warn, Instrument};

use super::ports::PortAllocator;
use super::supervisor::{
    layer_env, HealthCheck, ProcessSpec, ProcessSupervisor, ShutdownOutcome, SupervisedProcess,
};
use crate::agent_api::AgentApiClient;
use crate::config::{AgentServerConfig, PortRange, TimeoutConfig};
use crate::{AppError, Result};

/// Loopback host every instance binds to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Per-instance launch options. Unset fields fall back to the manager's
/// [`AgentServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    /// Working directory of the agent server.
    pub working_dir: PathBuf,
    /// Fixed port; allocated from the range when unset.
    pub port: Option<u16>,
    /// Per-instance environment overrides (highest precedence).
    pub env: HashMap<String, String>,
    /// Model override.
    pub model: Option<String>,
    /// Verbose logging override.
    pub verbose: Option<bool>,
    /// Permission bypass override.
    pub yolo_mode: Option<bool>,
}

impl InstanceConfig {
    /// Options for an instance rooted at `working_dir`.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }
}

/// Read-only view of a tracked instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Logical session id the instance was started for.
    pub session_id: String,
    /// Loopback port.
    pub port: u16,
    /// OS process id.
    pub pid: Option<u32>,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Session id assigned by the agent server, once created.
    pub agent_session_id: Option<String>,
}

impl InstanceInfo {
    /// Base URL of the instance.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{LOOPBACK_HOST}:{}", self.port)
    }
}

struct AgentServerInstance {
    info: InstanceInfo,
    process: SupervisedProcess,
    api: AgentApiClient,
}

#[derive(Default)]
struct Tracked {
    instances: HashMap<String, AgentServerInstance>,
    starting: HashSet<String>,
}

/// Clears the `starting` mark and releases the port of a start that did
/// not end with a tracked instance, including a start whose future was
/// dropped mid-launch.
struct PendingStart<'a> {
    manager: &'a AgentServerManager,
    session_id: &'a str,
    port: Option<u16>,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if let Ok(mut tracked) = self.manager.tracked.lock() {
            tracked.starting.remove(self.session_id);
        }
        if let Some(port) = self.port {
            self.manager.ports.release(port);
        }
    }
}

/// Creates and destroys agent-server instances.
pub struct AgentServerManager {
    settings: AgentServerConfig,
    timeouts: TimeoutConfig,
    manager_env: HashMap<String, String>,
    ports: PortAllocator,
    supervisor: ProcessSupervisor,
    http: reqwest::Client,
    tracked: Mutex<Tracked>,
}

impl AgentServerManager {
    /// Create a manager.
    ///
    /// `credentials` are resolved secrets injected into every instance;
    /// `settings.env` overrides them.
    #[must_use]
    pub fn new(
        settings: AgentServerConfig,
        ports: PortRange,
        timeouts: TimeoutConfig,
        credentials: HashMap<String, String>,
    ) -> Self {
        let mut manager_env = credentials;
        manager_env.extend(settings.env.clone());
        let http = reqwest::Client::new();
        Self {
            settings,
            timeouts,
            manager_env,
            ports: PortAllocator::new(ports),
            supervisor: ProcessSupervisor::new(http.clone()),
            http,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tracked>> {
        self.tracked
            .lock()
            .map_err(|_| AppError::Io("agent server manager lock poisoned".into()))
    }

    /// The port allocator backing this manager.
    #[must_use]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start and health-check an instance for `session_id`.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyExists` if `session_id` already has an instance.
    /// - `AppError::NoPortsAvailable` if the range is exhausted.
    /// - `AppError::ServerStart` if the process cannot be spawned.
    /// - `AppError::ServerHealthCheck` if it exits or never becomes healthy.
    pub async fn start_instance(
        &self,
        session_id: &str,
        config: InstanceConfig,
    ) -> Result<InstanceInfo> {
        {
            let mut tracked = self.lock()?;
            if tracked.instances.contains_key(session_id) || tracked.starting.contains(session_id) {
                return Err(AppError::AlreadyExists(format!(
                    "agent server for session '{session_id}' already exists"
                )));
            }
            tracked.starting.insert(session_id.to_owned());
        }
        let mut pending = PendingStart {
            manager: self,
            session_id,
            port: None,
        };

        let port = match config.port {
            Some(port) => {
                self.ports.reserve(port)?;
                port
            }
            None => self.ports.allocate()?,
        };
        pending.port = Some(port);

        let span = info_span!("start_instance", session_id, port);
        let instance = self.launch(session_id, port, config).instrument(span).await?;
        let info = instance.info.clone();
        self.lock()?
            .instances
            .insert(session_id.to_owned(), instance);
        pending.port = None;
        Ok(info)
    }

    async fn launch(
        &self,
        session_id: &str,
        port: u16,
        config: InstanceConfig,
    ) -> Result<AgentServerInstance> {
        let spec = self.build_spec(port, &config);
        let mut process = self.supervisor.spawn(&spec)?;

        let base_url = format!("http://{LOOPBACK_HOST}:{port}");
        let check = HealthCheck {
            url: format!("{base_url}/global/health"),
            timeout: self.timeouts.health_check(),
            interval: self.timeouts.health_interval(),
            probe_timeout: self.timeouts.health_probe(),
        };

        if let Err(err) = self.supervisor.wait_healthy(&mut process, &check).await {
            warn!(port, %err, "agent server failed to start, tearing down");
            self.supervisor
                .terminate(&mut process, self.timeouts.stop(), self.timeouts.kill())
                .await;
            return Err(err);
        }

        process.drain_stderr(format!("agent-server:{session_id}"));
        let info = InstanceInfo {
            session_id: session_id.to_owned(),
            port,
            pid: process.pid(),
            working_dir: config.working_dir.clone(),
            agent_session_id: None,
        };
        let api = AgentApiClient::new(self.http.clone(), base_url, self.timeouts.http())
            .with_directory(config.working_dir.to_string_lossy())
            .with_password(self.settings.password.clone());

        info!(port, pid = info.pid.unwrap_or(0), "agent server healthy");
        Ok(AgentServerInstance { info, process, api })
    }

    /// Command line and environment for an instance on `port`.
    #[must_use]
    pub fn build_spec(&self, port: u16, config: &InstanceConfig) -> ProcessSpec {
        let mut args = self.settings.serve_args.clone();
        args.extend([
            "--port".to_owned(),
            port.to_string(),
            "--hostname".to_owned(),
            LOOPBACK_HOST.to_owned(),
        ]);
        if let Some(model) = config.model.as_ref().or(self.settings.model.as_ref()) {
            args.extend(["--model".to_owned(), model.clone()]);
        }
        if config.verbose.unwrap_or(self.settings.verbose) {
            args.extend([
                "--log-level".to_owned(),
                "DEBUG".to_owned(),
                "--print-logs".to_owned(),
            ]);
        }

        let mut yolo = HashMap::new();
        if config.yolo_mode.unwrap_or(self.settings.yolo_mode) {
            yolo.insert(self.settings.permission_env.clone(), "allow".to_owned());
        }

        ProcessSpec {
            program: self.settings.binary.clone(),
            args,
            env: layer_env(&[&self.manager_env, &yolo, &config.env]),
            cwd: config.working_dir.clone(),
        }
    }

    /// Stop the instance for `session_id`; a no-op if there is none.
    ///
    /// Escalates from a best-effort abort (when `graceful` and an agent
    /// session id is known) to SIGTERM and then SIGKILL. The port is
    /// released and the instance forgotten whatever the outcome.
    pub async fn stop_instance(
        &self,
        session_id: &str,
        agent_session_id: Option<&str>,
        graceful: bool,
    ) -> Option<ShutdownOutcome> {
        let removed = match self.lock() {
            Ok(mut tracked) => tracked.instances.remove(session_id),
            Err(err) => {
                error!(%err, session_id, "cannot stop instance");
                None
            }
        };
        let mut instance = removed?;

        let span = info_span!("stop_instance", session_id, port = instance.info.port);
        async {
            let abort_id = agent_session_id
                .map(str::to_owned)
                .or_else(|| instance.info.agent_session_id.clone());
            if graceful && instance.process.is_running() {
                if let Some(id) = abort_id {
                    instance.api.abort(&id, self.timeouts.abort()).await;
                }
            }

            let outcome = self
                .supervisor
                .terminate(
                    &mut instance.process,
                    self.timeouts.stop(),
                    self.timeouts.kill(),
                )
                .await;
            self.ports.release(instance.info.port);
            info!(?outcome, "agent server stopped");
            Some(outcome)
        }
        .instrument(span)
        .await
    }

    /// Stop every tracked instance concurrently, each bounded by the
    /// shutdown stage timeout.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = match self.lock() {
            Ok(tracked) => tracked.instances.keys().cloned().collect(),
            Err(err) => {
                error!(%err, "cannot enumerate instances");
                return;
            }
        };
        let bound = self.timeouts.shutdown_stage();
        let stops = ids.iter().map(|id| async move {
            if tokio::time::timeout(bound, self.stop_instance(id, None, true))
                .await
                .is_err()
            {
                error!(session_id = %id, "instance stop exceeded shutdown bound");
            }
        });
        join_all(stops).await;
    }

    /// Create an agent session on the running instance for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if no running instance exists, or the
    /// agent server's error if creation fails.
    pub async fn create_agent_session(&self, session_id: &str) -> Result<String> {
        let api = self.running_api(session_id)?;
        let agent_session_id = api.create_session(&self.settings.permissions).await?;
        if let Some(instance) = self.lock()?.instances.get_mut(session_id) {
            instance.info.agent_session_id = Some(agent_session_id.clone());
        }
        Ok(agent_session_id)
    }

    /// Best-effort abort; `false` on any failure.
    pub async fn abort_agent_session(&self, session_id: &str, agent_session_id: &str) -> bool {
        match self.running_api(session_id) {
            Ok(api) => api.abort(agent_session_id, self.timeouts.abort()).await,
            Err(err) => {
                warn!(session_id, %err, "abort skipped");
                false
            }
        }
    }

    fn running_api(&self, session_id: &str) -> Result<AgentApiClient> {
        let mut tracked = self.lock()?;
        if let Some(instance) = tracked.instances.get_mut(session_id) {
            if instance.process.is_running() {
                return Ok(instance.api.clone());
            }
        }
        Err(AppError::Session(format!(
            "no running agent server for session '{session_id}'"
        )))
    }

    /// API client of a running instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if no running instance exists.
    pub fn api_client(&self, session_id: &str) -> Result<AgentApiClient> {
        self.running_api(session_id)
    }

    /// Snapshot of the instance for `session_id`.
    #[must_use]
    pub fn instance(&self, session_id: &str) -> Option<InstanceInfo> {
        self.lock()
            .ok()?
            .instances
            .get(session_id)
            .map(|i| i.info.clone())
    }

    /// Snapshots of every tracked instance.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.lock()
            .map(|tracked| tracked.instances.values().map(|i| i.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether `session_id` has a tracked instance whose process is alive.
    #[must_use]
    pub fn is_running(&self, session_id: &str) -> bool {
        self.running_api(session_id).is_ok()
    }
}
