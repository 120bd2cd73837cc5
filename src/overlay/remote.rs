//! Client side of the overlay: talk to a remote daemon and forward a local
//! port to a remote session proxy.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::relay::relay;
use super::{OverlayContext, OverlayNetwork};
use crate::ipc::RpcClient;
use crate::models::session::SessionStatus;
use crate::orchestrator::agent_server::LOOPBACK_HOST;
use crate::{AppError, Result};

/// Parameters of the daemon's `start_session` method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartSessionParams {
    /// Task name.
    pub task_name: String,
    /// Task directory on the daemon host.
    pub task_dir: String,
    /// Agent identifier.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Iteration cap.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i64,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_agent() -> String {
    "opencode".into()
}

fn default_max_iterations() -> i64 {
    50
}

/// Result of a remote `start_session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartedSession {
    /// Task name.
    pub task_name: String,
    /// Proxy service for reaching the agent server, when the overlay is on.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Agent-server port on the daemon host.
    pub port: u16,
    /// Agent session created on the server.
    #[serde(default)]
    pub agent_session_id: Option<String>,
}

/// JSON-RPC client for a remote daemon's control service.
#[derive(Debug)]
pub struct RemoteDaemonClient {
    service: String,
    rpc: RpcClient,
}

impl RemoteDaemonClient {
    /// Dial `service` using `context`.
    ///
    /// # Errors
    ///
    /// Returns the dial error if the control service is unreachable.
    pub async fn connect(
        context: &Arc<dyn OverlayContext>,
        service: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = context.dial(service).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            service: service.to_owned(),
            rpc: RpcClient::from_stream(reader, writer).with_timeout(timeout),
        })
    }

    /// Control service this client talks to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Round-trip check.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error.
    pub async fn ping(&self) -> Result<Value> {
        self.rpc.request("ping", json!({})).await
    }

    /// Every session the daemon knows about.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error.
    pub async fn list_sessions(&self) -> Result<Vec<Value>> {
        let result = self.rpc.request("list_sessions", json!({})).await?;
        Ok(result
            .get("sessions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Status the daemon reports for `task_name`; `None` if it has no
    /// record of the task.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error.
    pub async fn session_status(&self, task_name: &str) -> Result<Option<SessionStatus>> {
        let result = self
            .rpc
            .request("session_status", json!({ "task_name": task_name }))
            .await?;
        Ok(result
            .get("status")
            .and_then(Value::as_str)
            .and_then(SessionStatus::parse))
    }

    /// Start a session on the daemon host.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error, including the daemon's own
    /// start failure.
    pub async fn start_session(&self, params: &StartSessionParams) -> Result<StartedSession> {
        let result = self
            .rpc
            .request("start_session", serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Stop a session on the daemon host.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error.
    pub async fn stop_session(&self, task_name: &str) -> Result<Value> {
        self.rpc
            .request("stop_session", json!({ "task_name": task_name }))
            .await
    }

    /// Ask a session on the daemon host to checkpoint.
    ///
    /// # Errors
    ///
    /// Returns any transport or RPC error.
    pub async fn checkpoint_session(&self, task_name: &str) -> Result<Value> {
        self.rpc
            .request("checkpoint_session", json!({ "task_name": task_name }))
            .await
    }
}

/// Load the identity at `identity_path` and dial the control service.
///
/// # Errors
///
/// Returns the identity or dial error.
pub async fn connect_remote(
    network: &dyn OverlayNetwork,
    identity_path: &Path,
    control_service: &str,
    timeout: Duration,
) -> Result<RemoteDaemonClient> {
    let context = network.load_identity(identity_path).await?;
    RemoteDaemonClient::connect(&context, control_service, timeout).await
}

/// Loopback TCP port relaying each connection to a remote overlay service.
#[derive(Debug)]
pub struct LocalForwarder {
    service: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LocalForwarder {
    /// Bind an ephemeral loopback port forwarding to `service`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the local port cannot be bound.
    pub async fn start(context: Arc<dyn OverlayContext>, service: &str) -> Result<Self> {
        let listener = TcpListener::bind((LOOPBACK_HOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let ct = cancel.clone();
        let target = service.to_owned();
        let span = info_span!("local_forwarder", service = %target, %local_addr);

        let task = tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        () = ct.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let (local, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "forwarder accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let context = Arc::clone(&context);
                    let target = target.clone();
                    let ct = ct.clone();
                    tokio::spawn(async move {
                        let remote = match context.dial(&target).await {
                            Ok(remote) => remote,
                            Err(err) => {
                                warn!(%peer, %err, "cannot reach remote service");
                                return;
                            }
                        };
                        tokio::select! {
                            () = ct.cancelled() => {}
                            result = relay(local, remote) => {
                                if let Err(err) = result {
                                    debug!(%peer, %err, "forwarded connection ended");
                                }
                            }
                        }
                    });
                }
            }
            .instrument(span),
        );

        info!(service, %local_addr, "local forwarder listening");
        Ok(Self {
            service: service.to_owned(),
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// Remote service being forwarded.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Local address clients connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://127.0.0.1:<port>` for HTTP clients.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop forwarding and close every relayed connection.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(%err, "forwarder task failed");
            }
        }
    }
}

impl Drop for LocalForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Identity path required for overlay operations.
///
/// # Errors
///
/// Returns `AppError::Config` when no identity is configured.
pub fn require_identity(identity_path: Option<&PathBuf>) -> Result<&PathBuf> {
    identity_path.ok_or_else(|| AppError::Config("overlay.identity_path is not configured".into()))
}
