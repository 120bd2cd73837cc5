//! Per-session control RPC server on a Unix domain socket.
//!
//! ## Methods
//!
//! ```json
//! {"jsonrpc":"2.0","id":1,"method":"get_status"}
//! {"jsonrpc":"2.0","id":2,"method":"set_interactive_mode","params":{"enabled":true}}
//! {"jsonrpc":"2.0","id":3,"method":"subscribe","params":{"events":["output"]}}
//! ```
//!
//! Subscribers receive `{"jsonrpc":"2.0","method":"event","params":{"type":
//! "output","timestamp":"...","data":{"line":"..."}}}`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::{GenericFilePath, ListenerOptions, ToFsName};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::{
    serve_connection, ConnectionHandle, ConnectionId, ConnectionLimits, RpcHandler,
};
use super::hooks::LoopHooks;
use super::protocol::{self, EventKind, RpcError, RpcRequest, WILDCARD};
use super::state::{RpcSessionState, StateUpdate};
use crate::config::RpcConfig;
use crate::{AppError, Result};

struct Subscriber {
    events: BTreeSet<String>,
    handle: ConnectionHandle,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.events.contains(WILDCARD) || self.events.contains(kind.as_str())
    }
}

struct Shared {
    state: Mutex<RpcSessionState>,
    subscribers: Mutex<HashMap<ConnectionId, Subscriber>>,
    hooks: Arc<dyn LoopHooks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control server for one loop session.
pub struct ControlRpcServer {
    shared: Arc<Shared>,
    limits: ConnectionLimits,
    cancel: CancellationToken,
    socket_path: Mutex<Option<PathBuf>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlRpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRpcServer")
            .field("socket_path", &*lock(&self.socket_path))
            .finish_non_exhaustive()
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

impl ControlRpcServer {
    /// Server owning `state` and calling `hooks` on control requests.
    #[must_use]
    pub fn new(state: RpcSessionState, hooks: Arc<dyn LoopHooks>, config: &RpcConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                subscribers: Mutex::new(HashMap::new()),
                hooks,
            }),
            limits: ConnectionLimits::from_config(config),
            cancel: CancellationToken::new(),
            socket_path: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind `socket_path` (mode 0600) and start accepting connections.
    ///
    /// A leftover socket file from a previous run is removed first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the listener cannot be created or the
    /// server is already started.
    pub fn start(&self, socket_path: &Path) -> Result<()> {
        let mut current = lock(&self.socket_path);
        if current.is_some() {
            return Err(AppError::Ipc("control server already started".into()));
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let name = socket_path
            .to_fs_name::<GenericFilePath>()
            .map_err(|err| {
                AppError::Ipc(format!("invalid socket path {}: {err}", socket_path.display()))
            })?;
        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|err| AppError::Ipc(format!("failed to bind control socket: {err}")))?;
        restrict_permissions(socket_path)?;

        info!(path = %socket_path.display(), "control server listening");

        let shared = Arc::clone(&self.shared);
        let limits = self.limits;
        let ct = self.cancel.clone();
        let span = info_span!("control_rpc", path = %socket_path.display());
        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = ct.cancelled() => {
                            info!("control server shutting down");
                            break;
                        }
                        accept_result = listener.accept() => match accept_result {
                            Ok(stream) => {
                                let shared = Arc::clone(&shared);
                                let ct = ct.clone();
                                let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let (reader, writer) = stream.split();
                                    serve_connection(id, reader, writer, shared, limits, &ct).await;
                                });
                            }
                            Err(err) => {
                                warn!(%err, "control socket accept failed");
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        *lock(&self.accept_task) = Some(handle);
        *current = Some(socket_path.to_path_buf());
        Ok(())
    }

    /// Stop accepting, close every connection, and remove the socket file.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "control accept task panicked");
            }
        }
        let subscribers: Vec<Subscriber> = lock(&self.shared.subscribers)
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in subscribers {
            sub.handle.cancel.cancel();
        }
        if let Some(path) = lock(&self.socket_path).take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "failed to remove socket"),
            }
        }
    }

    /// Bound socket path, if started.
    #[must_use]
    pub fn socket_path(&self) -> Option<PathBuf> {
        lock(&self.socket_path).clone()
    }

    /// Append an output line and notify `output` subscribers.
    pub fn append_output(&self, line: impl Into<String>) {
        let line = line.into();
        lock(&self.shared.state).output.push(line.clone());
        self.shared.emit(EventKind::Output, json!({ "line": line }));
    }

    /// Apply a partial update; notifies `state_change` subscribers with the
    /// diff when anything changed. Returns the diff.
    pub fn update_state(&self, update: StateUpdate) -> Map<String, Value> {
        let diff = lock(&self.shared.state).apply(update);
        if !diff.is_empty() {
            self.shared
                .emit(EventKind::StateChange, Value::Object(diff.clone()));
        }
        diff
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RpcSessionState {
        lock(&self.shared.state).clone()
    }

    /// Consume the prompt queued by `inject_prompt`, if any.
    #[must_use]
    pub fn take_injected_prompt(&self) -> Option<String> {
        lock(&self.shared.state).injected_prompt.take()
    }

    /// Whether a human currently steers the session.
    #[must_use]
    pub fn interactive_mode(&self) -> bool {
        lock(&self.shared.state).interactive_mode
    }

    /// Connected clients.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }
}

impl Drop for ControlRpcServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    /// Queue an event on every matching subscriber. A subscriber whose
    /// queue is full or closed is dropped and its connection closed.
    fn emit(&self, kind: EventKind, data: Value) {
        let line = protocol::event_notification(kind, data).to_line();
        let mut subscribers = lock(&self.subscribers);
        let mut dropped = Vec::new();
        for (id, sub) in subscribers.iter() {
            if !sub.wants(kind) {
                continue;
            }
            if let Err(err) = sub.handle.tx.try_send(line.clone()) {
                warn!(conn = id, %err, "dropping subscriber");
                dropped.push(*id);
            }
        }
        for id in dropped {
            if let Some(sub) = subscribers.remove(&id) {
                sub.handle.cancel.cancel();
            }
        }
    }

    fn dispatch(&self, conn: ConnectionId, request: &RpcRequest) -> std::result::Result<Value, RpcError> {
        let params = &request.params;
        match request.method.as_str() {
            "get_status" => Ok(lock(&self.state).to_json()),
            "stop" => {
                info!("stop requested over rpc");
                self.hooks.on_stop();
                Ok(json!({ "status": "stop_requested" }))
            }
            "checkpoint" => {
                info!("checkpoint requested over rpc");
                self.hooks.on_checkpoint();
                Ok(json!({ "status": "checkpoint_requested" }))
            }
            "inject_prompt" => self.inject_prompt(params),
            "set_interactive_mode" => self.set_interactive_mode(params),
            "write_pty" => self.write_pty(params),
            "subscribe" => self.subscribe(conn, params),
            "unsubscribe" => self.unsubscribe(conn, params),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn inject_prompt(&self, params: &Map<String, Value>) -> std::result::Result<Value, RpcError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RpcError::invalid_params("'prompt' must be a non-empty string"))?
            .to_owned();
        {
            let mut state = lock(&self.state);
            state.injected_prompt = Some(prompt.clone());
            state.updated_at = chrono::Utc::now();
        }
        self.emit(EventKind::StateChange, json!({ "injected_prompt": prompt }));
        Ok(json!({ "status": "prompt_injected", "prompt": prompt }))
    }

    fn set_interactive_mode(
        &self,
        params: &Map<String, Value>,
    ) -> std::result::Result<Value, RpcError> {
        let enabled = params
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcError::invalid_params("'enabled' must be a boolean"))?;
        {
            let mut state = lock(&self.state);
            state.interactive_mode = enabled;
            state.updated_at = chrono::Utc::now();
        }
        info!(enabled, "interactive mode changed");
        self.emit(EventKind::StateChange, json!({ "interactive_mode": enabled }));
        self.hooks.on_interactive_mode(enabled);
        Ok(json!({ "interactive_mode": enabled }))
    }

    fn write_pty(&self, params: &Map<String, Value>) -> std::result::Result<Value, RpcError> {
        let data = params
            .get("data")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| RpcError::invalid_params("'data' must be a non-empty string"))?;
        if !lock(&self.state).interactive_mode {
            return Ok(json!({ "status": "ignored", "reason": "not in interactive mode" }));
        }
        self.hooks.on_write_pty(data);
        Ok(json!({ "status": "forwarded" }))
    }

    fn subscribe(
        &self,
        conn: ConnectionId,
        params: &Map<String, Value>,
    ) -> std::result::Result<Value, RpcError> {
        let names = protocol::parse_event_names(params)?;
        let mut subscribers = lock(&self.subscribers);
        let sub = subscribers
            .get_mut(&conn)
            .ok_or_else(|| RpcError::internal("connection is closed"))?;
        sub.events.extend(names);
        Ok(json!({ "subscribed": sub.events }))
    }

    fn unsubscribe(
        &self,
        conn: ConnectionId,
        params: &Map<String, Value>,
    ) -> std::result::Result<Value, RpcError> {
        let names = protocol::parse_event_names(params)?;
        let mut subscribers = lock(&self.subscribers);
        let sub = subscribers
            .get_mut(&conn)
            .ok_or_else(|| RpcError::internal("connection is closed"))?;
        sub.events.retain(|event| !names.contains(event));
        Ok(json!({ "subscribed": sub.events }))
    }
}

impl RpcHandler for Shared {
    fn handle(
        &self,
        conn: ConnectionId,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Value, RpcError>> + Send + '_>> {
        Box::pin(async move { self.dispatch(conn, &request) })
    }

    fn on_connect(&self, handle: &ConnectionHandle) {
        debug!(conn = handle.id, "rpc client connected");
        lock(&self.subscribers).insert(
            handle.id,
            Subscriber {
                events: BTreeSet::new(),
                handle: handle.clone(),
            },
        );
    }

    fn on_disconnect(&self, conn: ConnectionId) {
        debug!(conn, "rpc client disconnected");
        lock(&self.subscribers).remove(&conn);
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
