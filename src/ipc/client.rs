//! NDJSON JSON-RPC client with request/response correlation.
//!
//! Works over any split byte stream: the control socket of a local session
//! or an overlay connection to a remote daemon.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::tokio::Stream;
use interprocess::local_socket::{GenericFilePath, ToFsName};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::RpcCodec;
use super::protocol::{self, RpcId, RpcNotification, RpcResponse, ServerMessage};
use crate::{AppError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Client side of one RPC connection.
pub struct RpcClient {
    writer: tokio::sync::Mutex<Writer>,
    pending: Pending,
    next_id: AtomicI64,
    events: Mutex<Option<mpsc::Receiver<RpcNotification>>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Connect to a session's control socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the socket does not exist or refuses.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let name = socket_path
            .to_fs_name::<GenericFilePath>()
            .map_err(|err| {
                AppError::Ipc(format!("invalid socket path {}: {err}", socket_path.display()))
            })?;
        let stream = Stream::connect(name).await.map_err(|err| {
            AppError::Ipc(format!("cannot connect to {}: {err}", socket_path.display()))
        })?;
        let (reader, writer) = stream.split();
        Ok(Self::from_stream(reader, writer))
    }

    /// Client over an already-connected stream.
    pub fn from_stream<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            events_tx,
            cancel.clone(),
        ));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicI64::new(1),
            events: Mutex::new(Some(events_rx)),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the stream of server-pushed events. Returns `None` after the
    /// first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<RpcNotification>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Send a request and wait for its raw response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on write failure, timeout, or if the
    /// connection closes before the answer arrives.
    pub async fn call(&self, method: &str, params: Value) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.write_line(&line).await {
            self.forget(id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(AppError::Ipc(format!(
                "connection closed before {method} was answered"
            ))),
            Err(_) => {
                self.forget(id);
                Err(AppError::Ipc(format!(
                    "{method} timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// Send a request and return its result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` carrying the server's error message and
    /// code, or any error from [`RpcClient::call`].
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let resp = self.call(method, params).await?;
        match resp.error {
            Some(err) => Err(AppError::Protocol(format!(
                "{method} failed ({}): {}",
                err.code, err.message
            ))),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        }
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on write failure.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write_line(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Ipc(format!("rpc write failed: {err}")))?;
        writer
            .flush()
            .await
            .map_err(|err| AppError::Ipc(format!("rpc flush failed: {err}")))
    }

    fn forget(&self, id: i64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    pending: Pending,
    events: mpsc::Sender<RpcNotification>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(reader, RpcCodec::new(usize::MAX));
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = lines.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                debug!(%err, "rpc client read failed");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match protocol::parse_server_message(&line) {
            Ok(ServerMessage::Response(resp)) => {
                let Some(RpcId::Num(id)) = resp.id else {
                    warn!(id = ?resp.id, "uncorrelated rpc response");
                    continue;
                };
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(resp);
                }
            }
            Ok(ServerMessage::Notification(note)) => {
                // Unread events are dropped rather than stalling responses.
                if let Err(err) = events.try_send(note) {
                    debug!(%err, "event not delivered");
                }
            }
            Err(err) => warn!(%err, "unparseable rpc message"),
        }
    }
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}
