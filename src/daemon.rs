//! Daemon composition: agent-server instances, overlay services, loop
//! drivers, and the control methods remote clients call.
//!
//! Control methods (NDJSON JSON-RPC over the overlay control service):
//!
//! | method               | params                                   |
//! |----------------------|------------------------------------------|
//! | `ping`               | none                                     |
//! | `list_sessions`      | none                                     |
//! | `session_status`     | `task_name`                              |
//! | `start_session`      | `task_name, task_dir, agent?, max_iterations?, model?` |
//! | `stop_session`       | `task_name`                              |
//! | `checkpoint_session` | `task_name`                              |

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::ipc::connection::{ConnectionId, ConnectionLimits, RpcHandler};
use crate::ipc::protocol::{RpcError, RpcRequest};
use crate::models::session::{ExecutionMode, ServerInfo, SessionRecord, SessionStatus};
use crate::multiplexer::Multiplexer;
use crate::orchestrator::agent_server::{AgentServerManager, InstanceConfig, InstanceInfo};
use crate::orchestrator::lifecycle::SessionLifecycle;
use crate::orchestrator::supervisor::{layer_env, ProcessSpec, ProcessSupervisor};
use crate::overlay::remote::{StartSessionParams, StartedSession};
use crate::overlay::{OverlayControlService, OverlayNetwork, ProxyServiceManager};
use crate::persistence::db;
use crate::persistence::retention::spawn_retention_task;
use crate::persistence::session_repo::SessionRegistry;
use crate::{AppError, Result};

/// Task name passed to a daemon-launched driver.
pub const ENV_TASK: &str = "AGENT_LOOP_TASK";
/// Agent-server base URL passed to a daemon-launched driver.
pub const ENV_SERVER_URL: &str = "AGENT_LOOP_SERVER_URL";
/// Agent session id passed to a daemon-launched driver.
pub const ENV_AGENT_SESSION: &str = "AGENT_LOOP_AGENT_SESSION_ID";
/// Iteration cap passed to a daemon-launched driver.
pub const ENV_MAX_ITERATIONS: &str = "AGENT_LOOP_MAX_ITERATIONS";

struct DaemonState {
    config: GlobalConfig,
    hostname: String,
    lifecycle: SessionLifecycle,
    servers: AgentServerManager,
    proxies: Option<ProxyServiceManager>,
    supervisor: ProcessSupervisor,
    drivers: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
}

/// JSON-RPC handler for the daemon's control methods.
#[derive(Clone)]
pub struct DaemonControl {
    state: Arc<DaemonState>,
}

impl std::fmt::Debug for DaemonControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonControl")
            .field("hostname", &self.state.hostname)
            .finish_non_exhaustive()
    }
}

/// The running daemon.
pub struct Daemon {
    state: Arc<DaemonState>,
    control: Option<OverlayControlService>,
    retention: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Open the registry, reconcile leftover records, and start the overlay
    /// control service (when enabled) and the retention task.
    ///
    /// # Errors
    ///
    /// Returns the registry, credential, or overlay error that prevented
    /// startup. Nothing is left running on failure.
    pub async fn start(
        config: GlobalConfig,
        network: Arc<dyn OverlayNetwork>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Result<Self> {
        let database = Arc::new(db::connect(config.db_path()).await?);
        let registry = SessionRegistry::new(database);
        info!(path = %config.db_path().display(), "registry opened");

        let credentials = config.load_credentials().await?;
        let servers = AgentServerManager::new(
            config.agent_server.clone(),
            config.ports,
            config.timeouts.clone(),
            credentials,
        );
        let lifecycle = SessionLifecycle::new(
            &config,
            registry.clone(),
            multiplexer,
            reqwest::Client::new(),
        );

        let stale = lifecycle
            .status()
            .await?
            .into_iter()
            .filter(|r| r.status == SessionStatus::Failed)
            .count();
        info!(failed = stale, "startup reconciliation complete");

        let hostname = config.overlay.effective_hostname();
        let proxies = match (&config.overlay.identity_path, config.overlay.enabled) {
            (Some(identity), true) => Some(ProxyServiceManager::new(
                Arc::clone(&network),
                identity.clone(),
                config.overlay.loop_service_prefix.clone(),
                config.timeouts.proxy_drain(),
            )),
            _ => None,
        };

        let cancel = CancellationToken::new();
        let retention = spawn_retention_task(registry, config.retention_days, cancel.clone());

        let state = Arc::new(DaemonState {
            hostname: hostname.clone(),
            lifecycle,
            servers,
            proxies,
            supervisor: ProcessSupervisor::default(),
            drivers: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            config,
        });

        let mut daemon = Self {
            state,
            control: None,
            retention: Some(retention),
            cancel,
        };

        if let (Some(identity), true) = (
            daemon.state.config.overlay.identity_path.clone(),
            daemon.state.config.overlay.enabled,
        ) {
            let mut control = OverlayControlService::new(
                daemon.state.config.overlay.control_service_name(&hostname),
                identity,
                network,
                Arc::new(daemon.control_handler()),
                ConnectionLimits::from_config(&daemon.state.config.rpc),
                daemon.state.config.timeouts.proxy_drain(),
            );
            if let Err(err) = control.start().await {
                error!(%err, "control service failed to start");
                daemon.shutdown().await;
                return Err(err);
            }
            daemon.control = Some(control);
        } else {
            info!("overlay disabled; serving local sessions only");
        }

        info!(hostname = %hostname, "daemon started");
        Ok(daemon)
    }

    /// Handler answering the daemon's control methods.
    #[must_use]
    pub fn control_handler(&self) -> DaemonControl {
        DaemonControl {
            state: Arc::clone(&self.state),
        }
    }

    /// Name of the bound control service, if the overlay is enabled.
    #[must_use]
    pub fn control_service_name(&self) -> Option<&str> {
        self.control.as_ref().map(OverlayControlService::service_name)
    }

    /// Registry shared with the lifecycle.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        self.state.lifecycle.registry()
    }

    /// Stop accepting control connections, then tear down drivers, proxies,
    /// and agent servers. Each stage is bounded by the shutdown stage
    /// timeout; a stage that overruns is logged and skipped.
    pub async fn shutdown(mut self) {
        let span = info_span!("daemon_shutdown");
        async move {
            let bound = self.state.config.timeouts.shutdown_stage();
            self.cancel.cancel();

            // ── Control service ─────────────────────────────
            if let Some(mut control) = self.control.take() {
                if tokio::time::timeout(bound, control.shutdown()).await.is_err() {
                    warn!("control service shutdown timed out");
                }
            }

            // ── Loop drivers ────────────────────────────────
            {
                let drivers = self
                    .state
                    .drivers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for token in drivers.values() {
                    token.cancel();
                }
            }
            self.state.tracker.close();
            if tokio::time::timeout(bound, self.state.tracker.wait())
                .await
                .is_err()
            {
                warn!("loop drivers did not exit in time");
            }

            // ── Proxy services ──────────────────────────────
            if let Some(proxies) = &self.state.proxies {
                proxies.shutdown_all(bound).await;
            }

            // ── Agent servers ───────────────────────────────
            let registry = self.state.lifecycle.registry();
            for instance in self.state.servers.instances() {
                if let Err(err) = registry
                    .update_status(&instance.session_id, SessionStatus::Stopped)
                    .await
                {
                    warn!(task_name = %instance.session_id, %err, "failed to record stop");
                }
            }
            self.state.servers.stop_all().await;

            if let Some(retention) = self.retention.take() {
                if let Err(err) = retention.await {
                    warn!(%err, "retention task failed");
                }
            }
            info!("daemon shut down");
        }
        .instrument(span)
        .await;
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RpcHandler for DaemonControl {
    fn handle(
        &self,
        _conn: ConnectionId,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Value, RpcError>> + Send + '_>> {
        Box::pin(async move {
            let params = request.params;
            let result = match request.method.as_str() {
                "ping" => Ok(self.ping()),
                "list_sessions" => self.list_sessions().await,
                "session_status" => self.session_status(&task_param(&params)?).await,
                "start_session" => {
                    let parsed: StartSessionParams =
                        serde_json::from_value(Value::Object(params))
                            .map_err(|err| RpcError::invalid_params(err.to_string()))?;
                    validate_start(&parsed)?;
                    self.start_session(parsed).await
                }
                "stop_session" => self.stop_session(&task_param(&params)?).await,
                "checkpoint_session" => self.checkpoint_session(&task_param(&params)?).await,
                other => return Err(RpcError::method_not_found(other)),
            };
            result.map_err(|err| app_error_to_rpc(&err))
        })
    }
}

impl DaemonControl {
    fn ping(&self) -> Value {
        json!({
            "status": "ok",
            "hostname": self.state.hostname,
            "version": env!("CARGO_PKG_VERSION"),
            "instances": self.state.servers.instances().len(),
        })
    }

    async fn list_sessions(&self) -> Result<Value> {
        let records = self.state.lifecycle.status().await?;
        Ok(json!({ "sessions": records }))
    }

    async fn session_status(&self, task_name: &str) -> Result<Value> {
        let record = self.state.lifecycle.reconciled(task_name).await?;
        Ok(json!({
            "task_name": task_name,
            "status": record.as_ref().map(|r| r.status.as_str()),
            "iteration": record.as_ref().map(|r| r.iteration),
            "current_story": record.as_ref().and_then(|r| r.current_story.clone()),
        }))
    }

    async fn start_session(&self, params: StartSessionParams) -> Result<Value> {
        let span = info_span!("start_session", task_name = %params.task_name);
        async {
            let state = &self.state;
            let task = params.task_name.as_str();
            state.lifecycle.ensure_startable(task).await?;

            let mut instance_config = InstanceConfig::new(&params.task_dir);
            instance_config.model.clone_from(&params.model);
            let instance = state.servers.start_instance(task, instance_config).await?;

            let agent_session_id = match state.servers.create_agent_session(task).await {
                Ok(id) => id,
                Err(err) => {
                    self.rollback(task, false).await;
                    return Err(err);
                }
            };

            let service_name = match &state.proxies {
                Some(proxies) => match proxies.register(task, task, instance.port).await {
                    Ok(name) => Some(name),
                    Err(err) => {
                        self.rollback(task, false).await;
                        return Err(err);
                    }
                },
                None => None,
            };

            let mut record = SessionRecord::new(
                task,
                &params.task_dir,
                &params.agent,
                ExecutionMode::AgentServer,
                u32::try_from(params.max_iterations).unwrap_or(0),
            )
            .with_server(ServerInfo {
                port: Some(instance.port),
                url: Some(instance.base_url()),
                agent_session_id: Some(agent_session_id.clone()),
            });
            record.worker_pid = instance.pid;

            if let Err(err) = state.lifecycle.registry().claim_running(&record).await {
                self.rollback(task, true).await;
                return Err(err);
            }
            state.lifecycle.signals().clear(task);

            if let Err(err) = self.launch_driver(&params, &instance, &agent_session_id).await {
                warn!(%err, "loop driver failed to launch");
                self.rollback(task, true).await;
                state
                    .lifecycle
                    .registry()
                    .update_status(task, SessionStatus::Failed)
                    .await?;
                return Err(err);
            }

            info!(port = instance.port, service = ?service_name, "session started");
            let started = StartedSession {
                task_name: params.task_name.clone(),
                service_name,
                port: instance.port,
                agent_session_id: Some(agent_session_id),
            };
            Ok(serde_json::to_value(started)?)
        }
        .instrument(span)
        .await
    }

    async fn stop_session(&self, task_name: &str) -> Result<Value> {
        let state = &self.state;
        let record = state
            .lifecycle
            .registry()
            .get(task_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no session found for task '{task_name}'")))?;

        self.cancel_driver(task_name);
        let outcome = state
            .servers
            .stop_instance(task_name, record.server.agent_session_id.as_deref(), true)
            .await;
        if let Some(proxies) = &state.proxies {
            proxies.deregister(task_name).await;
        }

        if outcome.is_none() && record.is_running() {
            // Started by an earlier daemon run or from the CLI.
            let stopped = state.lifecycle.stop(task_name).await?;
            return Ok(json!({ "task_name": task_name, "status": stopped.status.as_str() }));
        }
        state
            .lifecycle
            .registry()
            .update_status(task_name, SessionStatus::Stopped)
            .await?;
        info!(task_name, ?outcome, "session stopped");
        Ok(json!({ "task_name": task_name, "status": SessionStatus::Stopped.as_str() }))
    }

    async fn checkpoint_session(&self, task_name: &str) -> Result<Value> {
        self.state.lifecycle.checkpoint(task_name).await?;
        Ok(json!({ "task_name": task_name, "status": "checkpoint_requested" }))
    }

    async fn rollback(&self, task_name: &str, deregister: bool) {
        if deregister {
            if let Some(proxies) = &self.state.proxies {
                proxies.deregister(task_name).await;
            }
        }
        self.state.servers.stop_instance(task_name, None, false).await;
    }

    async fn launch_driver(
        &self,
        params: &StartSessionParams,
        instance: &InstanceInfo,
        agent_session_id: &str,
    ) -> Result<()> {
        let state = &self.state;
        let Some(binary) = state.config.driver.binary.clone() else {
            return Ok(());
        };
        let mut args = state.config.driver.args.clone();
        args.push(params.task_dir.clone());
        let env = HashMap::from([
            (ENV_TASK.to_owned(), params.task_name.clone()),
            (ENV_SERVER_URL.to_owned(), instance.base_url()),
            (ENV_AGENT_SESSION.to_owned(), agent_session_id.to_owned()),
            (ENV_MAX_ITERATIONS.to_owned(), params.max_iterations.to_string()),
        ]);
        let spec = ProcessSpec {
            program: binary,
            args,
            env: layer_env(&[&env]),
            cwd: Path::new(&params.task_dir).to_path_buf(),
        };

        let mut process = state.supervisor.spawn(&spec)?;
        let task = params.task_name.clone();
        if let Some(pid) = process.pid() {
            state.lifecycle.registry().update_worker_pid(&task, pid).await?;
        }
        process.drain_stderr(format!("driver:{task}"));

        let token = CancellationToken::new();
        state
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.clone(), token.clone());

        let control = self.clone();
        let span = info_span!("loop_driver", task_name = %task);
        state.tracker.spawn(
            async move {
                let timeouts = &control.state.config.timeouts;
                tokio::select! {
                    () = token.cancelled() => {
                        let outcome = control
                            .state
                            .supervisor
                            .terminate(&mut process, timeouts.stop(), timeouts.kill())
                            .await;
                        info!(?outcome, "loop driver stopped");
                    }
                    exited = process.wait() => {
                        control.finish_driver(&task, exited.map(|s| s.success())).await;
                    }
                }
            }
            .instrument(span),
        );
        info!(task_name = %params.task_name, "loop driver launched");
        Ok(())
    }

    async fn finish_driver(&self, task_name: &str, exited: Result<bool>) {
        self.state
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_name);

        let status = match exited {
            Ok(true) => SessionStatus::Completed,
            Ok(false) => SessionStatus::Failed,
            Err(err) => {
                warn!(task_name, %err, "lost track of loop driver");
                SessionStatus::Failed
            }
        };
        info!(task_name, status = status.as_str(), "loop driver exited");

        let registry = self.state.lifecycle.registry();
        let still_running = matches!(registry.get(task_name).await, Ok(Some(r)) if r.is_running());
        if let Some(proxies) = &self.state.proxies {
            proxies.deregister(task_name).await;
        }
        self.state.servers.stop_instance(task_name, None, false).await;
        if still_running {
            if let Err(err) = registry.update_status(task_name, status).await {
                warn!(task_name, %err, "failed to record driver exit");
            }
        }
    }

    fn cancel_driver(&self, task_name: &str) {
        let token = self
            .state
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_name);
        if let Some(token) = token {
            token.cancel();
        }
    }
}

fn task_param(params: &Map<String, Value>) -> std::result::Result<String, RpcError> {
    match params.get("task_name").and_then(Value::as_str) {
        Some(task) if !task.trim().is_empty() => Ok(task.to_owned()),
        _ => Err(RpcError::invalid_params("task_name must be a non-empty string")),
    }
}

fn validate_start(params: &StartSessionParams) -> std::result::Result<(), RpcError> {
    if params.task_name.trim().is_empty() {
        return Err(RpcError::invalid_params("task_name must be a non-empty string"));
    }
    if params.max_iterations < 1 {
        return Err(RpcError::invalid_params("max_iterations must be at least 1"));
    }
    if !Path::new(&params.task_dir).is_dir() {
        return Err(RpcError::invalid_params(format!(
            "task_dir does not exist: {}",
            params.task_dir
        )));
    }
    Ok(())
}

/// Map a domain error onto a JSON-RPC error carrying its category.
#[must_use]
pub fn app_error_to_rpc(err: &AppError) -> RpcError {
    let mut rpc = RpcError::internal(err.to_string());
    rpc.data = Some(json!({ "category": format!("{:?}", err.category()) }));
    rpc
}
