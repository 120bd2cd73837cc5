//! Transport-agnostic NDJSON JSON-RPC connection loop.
//!
//! Used by the per-session control socket and by the daemon's overlay
//! control service. Each connection gets a bounded outbound queue drained by
//! its own writer task; handlers and event producers only ever enqueue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::codec::RpcCodec;
use super::protocol::{self, RpcError, RpcRequest, RpcResponse};
use crate::config::RpcConfig;
use crate::AppError;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Outbound handle to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection id.
    pub id: ConnectionId,
    /// Bounded queue of serialized lines.
    pub tx: mpsc::Sender<String>,
    /// Cancelling closes the connection.
    pub cancel: CancellationToken,
}

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Outbound queue capacity in messages.
    pub queue_capacity: usize,
    /// Longest accepted inbound line.
    pub max_line_bytes: usize,
}

impl ConnectionLimits {
    /// Limits from the `[rpc]` configuration section.
    #[must_use]
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            queue_capacity: config.subscriber_queue,
            max_line_bytes: config.max_line_bytes,
        }
    }
}

/// Method dispatch for one kind of RPC endpoint.
pub trait RpcHandler: Send + Sync + 'static {
    /// Answer `request` received on connection `conn`.
    fn handle(
        &self,
        conn: ConnectionId,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + '_>>;

    /// A connection opened.
    fn on_connect(&self, _handle: &ConnectionHandle) {}

    /// A connection closed.
    fn on_disconnect(&self, _conn: ConnectionId) {}
}

/// Serve one connection until EOF, a read error, or `parent` is cancelled.
pub async fn serve_connection<H, R, W>(
    id: ConnectionId,
    mut reader: R,
    writer: W,
    handler: Arc<H>,
    limits: ConnectionLimits,
    parent: &CancellationToken,
) where
    H: RpcHandler + ?Sized,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = parent.child_token();
    let (tx, rx) = mpsc::channel(limits.queue_capacity.max(1));
    let handle = ConnectionHandle {
        id,
        tx: tx.clone(),
        cancel: cancel.clone(),
    };
    handler.on_connect(&handle);
    tokio::spawn(run_writer(id, writer, rx, cancel.clone()));

    let span = info_span!("rpc_conn", conn = id);
    async {
        let mut codec = RpcCodec::new(limits.max_line_bytes);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut eof = false;

        'conn: loop {
            loop {
                let decoded = if eof {
                    codec.decode_eof(&mut buf)
                } else {
                    codec.decode(&mut buf)
                };
                match decoded {
                    Ok(Some(line)) => {
                        if !dispatch_line(id, &line, handler.as_ref(), &tx).await {
                            break 'conn;
                        }
                    }
                    Ok(None) => break,
                    Err(AppError::Protocol(msg)) => {
                        warn!(%msg, "rejecting malformed rpc line");
                        let resp = RpcResponse::failure(
                            None,
                            RpcError::new(protocol::PARSE_ERROR, "Parse error"),
                        );
                        if tx.send(resp.to_line()).await.is_err() {
                            break 'conn;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "rpc framing error");
                        break 'conn;
                    }
                }
            }
            if eof {
                break;
            }

            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "rpc read error");
                    break;
                }
            }
        }
        debug!("rpc connection closed");
    }
    .instrument(span)
    .await;

    handler.on_disconnect(id);
    // Dropping the last sender lets the writer flush queued responses and exit.
    drop(tx);
}

/// Handle one decoded line. Returns false if the connection should close.
async fn dispatch_line<H: RpcHandler + ?Sized>(
    conn: ConnectionId,
    line: &str,
    handler: &H,
    tx: &mpsc::Sender<String>,
) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }

    let response = match protocol::parse_request(trimmed) {
        Err(resp) => Some(resp),
        Ok(request) => {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = handler.handle(conn, request).await;
            match (id, outcome) {
                (None, Err(err)) => {
                    debug!(%method, code = err.code, "notification failed");
                    None
                }
                (None, Ok(_)) => None,
                (Some(id), Ok(result)) => Some(RpcResponse::success(Some(id), result)),
                (Some(id), Err(err)) => Some(RpcResponse::failure(Some(id), err)),
            }
        }
    };

    match response {
        Some(resp) => tx.send(resp.to_line()).await.is_ok(),
        None => true,
    }
}

/// Drain `rx` into `writer`, one NDJSON line per message.
async fn run_writer<W: AsyncWrite + Unpin>(
    conn: ConnectionId,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut codec = RpcCodec::new(usize::MAX);
    let mut out = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(line) = msg else { break };
                out.clear();
                if let Err(err) = codec.encode(line, &mut out) {
                    warn!(conn, %err, "failed to frame rpc message");
                    continue;
                }
                if let Err(err) = writer.write_all(&out).await {
                    debug!(conn, %err, "rpc write failed, closing connection");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(conn, %err, "rpc writer shutdown failed");
    }
}
