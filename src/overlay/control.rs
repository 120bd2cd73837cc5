//! The per-host control service: daemon-level JSON-RPC over the overlay.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::service::{ConnectionHandler, OverlayService, ServiceState};
use super::{OverlayNetwork, OverlayStream};
use crate::ipc::connection::{serve_connection, ConnectionLimits, RpcHandler};
use crate::Result;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Serves each overlay connection as an NDJSON JSON-RPC session.
pub struct RpcOverlayHandler {
    rpc: Arc<dyn RpcHandler>,
    limits: ConnectionLimits,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RpcOverlayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcOverlayHandler")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RpcOverlayHandler {
    /// Handler dispatching to `rpc`; `cancel` closes every connection.
    #[must_use]
    pub fn new(rpc: Arc<dyn RpcHandler>, limits: ConnectionLimits, cancel: CancellationToken) -> Self {
        Self {
            rpc,
            limits,
            cancel,
        }
    }
}

impl ConnectionHandler for RpcOverlayHandler {
    fn handle(
        &self,
        stream: OverlayStream,
        peer: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
            info!(%peer, conn = id, "control client connected");
            let (reader, writer) = tokio::io::split(stream);
            serve_connection(id, reader, writer, Arc::clone(&self.rpc), self.limits, &self.cancel)
                .await;
        })
    }
}

/// Control service bound as `<control_prefix><hostname>`.
#[derive(Debug)]
pub struct OverlayControlService {
    service: OverlayService,
    cancel: CancellationToken,
}

impl OverlayControlService {
    /// Unbound control service answering with `rpc`.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        identity_path: impl Into<PathBuf>,
        network: Arc<dyn OverlayNetwork>,
        rpc: Arc<dyn RpcHandler>,
        limits: ConnectionLimits,
        drain_timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handler = RpcOverlayHandler::new(rpc, limits, cancel.clone());
        Self {
            service: OverlayService::new(
                service_name,
                identity_path,
                network,
                Arc::new(handler),
                drain_timeout,
            ),
            cancel,
        }
    }

    /// Load identity, bind, and start accepting.
    ///
    /// # Errors
    ///
    /// Returns the identity or bind error; the service is left unbound.
    pub async fn start(&mut self) -> Result<()> {
        self.service.load_identity().await?;
        self.service.bind().await?;
        self.service.start_accepting()?;
        info!(service = %self.service.name(), "control service started");
        Ok(())
    }

    /// Service name clients dial.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Lifecycle state of the underlying service.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.service.state()
    }

    /// Close client connections and unbind.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.service.shutdown().await;
    }
}
