//! Generic overlay service: identity, bind, accept loop, bounded shutdown.
//!
//! ```text
//! unbound -> identity-loaded -> bound -> accepting -> shutting-down -> unbound
//! ```

use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{OverlayContext, OverlayListener, OverlayNetwork, OverlayStream};
use crate::{AppError, Result};

/// Delay before retrying after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle position of an [`OverlayService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No identity and no listener.
    Unbound,
    /// Identity loaded, nothing bound yet.
    IdentityLoaded,
    /// Listener bound, not yet accepting.
    Bound,
    /// Accept loop running.
    Accepting,
    /// Shutdown in progress.
    ShuttingDown,
}

/// Serves one accepted overlay connection.
pub trait ConnectionHandler: Send + Sync + Debug + 'static {
    /// Handle `stream` from `peer` until it is finished.
    fn handle(
        &self,
        stream: OverlayStream,
        peer: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// One named service on the overlay.
#[derive(Debug)]
pub struct OverlayService {
    name: String,
    identity_path: PathBuf,
    network: Arc<dyn OverlayNetwork>,
    handler: Arc<dyn ConnectionHandler>,
    drain_timeout: Duration,
    state: ServiceState,
    context: Option<Arc<dyn OverlayContext>>,
    listener: Option<Box<dyn OverlayListener>>,
    accept_task: Option<JoinHandle<JoinSet<()>>>,
    cancel: CancellationToken,
}

impl OverlayService {
    /// Unbound service named `name`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        identity_path: impl Into<PathBuf>,
        network: Arc<dyn OverlayNetwork>,
        handler: Arc<dyn ConnectionHandler>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            identity_path: identity_path.into(),
            network,
            handler,
            drain_timeout,
            state: ServiceState::Unbound,
            context: None,
            listener: None,
            accept_task: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Whether the service holds a listener.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self.state, ServiceState::Bound | ServiceState::Accepting)
    }

    /// Loaded context, for dialing other services with the same identity.
    #[must_use]
    pub fn context(&self) -> Option<Arc<dyn OverlayContext>> {
        self.context.clone()
    }

    /// Load the identity credential.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the identity cannot be loaded; the
    /// service stays unbound.
    pub async fn load_identity(&mut self) -> Result<()> {
        if self.state != ServiceState::Unbound {
            return Ok(());
        }
        let context = self.network.load_identity(&self.identity_path).await?;
        self.context = Some(context);
        self.state = ServiceState::IdentityLoaded;
        Ok(())
    }

    /// Bind the service name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Overlay` if no identity is loaded or the service is
    /// already bound here, and the provider's error if binding fails.
    pub async fn bind(&mut self) -> Result<()> {
        let context = match (self.state, &self.context) {
            (ServiceState::IdentityLoaded, Some(context)) => Arc::clone(context),
            (ServiceState::Bound | ServiceState::Accepting, _) => {
                return Err(AppError::AlreadyExists(format!(
                    "service {} is already bound",
                    self.name
                )))
            }
            _ => {
                return Err(AppError::Overlay(format!(
                    "cannot bind {}: identity not loaded",
                    self.name
                )))
            }
        };
        let listener = context.bind(&self.name).await?;
        self.listener = Some(listener);
        self.state = ServiceState::Bound;
        Ok(())
    }

    /// Spawn the accept loop. Each connection runs in its own task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Overlay` if the service is not bound.
    pub fn start_accepting(&mut self) -> Result<()> {
        let Some(mut listener) = self.listener.take() else {
            return Err(AppError::Overlay(format!(
                "cannot accept on {}: not bound",
                self.name
            )));
        };

        let handler = Arc::clone(&self.handler);
        let ct = self.cancel.clone();
        let span = info_span!("overlay_service", service = %self.name);
        self.accept_task = Some(tokio::spawn(
            async move {
                let mut connections = JoinSet::new();
                info!("accepting connections");
                loop {
                    tokio::select! {
                        () = ct.cancelled() => break,
                        Some(_) = connections.join_next(), if !connections.is_empty() => {}
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "connection accepted");
                                let handler = Arc::clone(&handler);
                                connections.spawn(async move {
                                    handler.handle(stream, peer).await;
                                });
                            }
                            Err(err) => {
                                if ct.is_cancelled() {
                                    break;
                                }
                                warn!(%err, "accept failed, retrying");
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                        }
                    }
                }
                info!("stopped accepting connections");
                drop(listener);
                connections
            }
            .instrument(span),
        ));
        self.state = ServiceState::Accepting;
        Ok(())
    }

    /// Stop accepting, wait up to the drain timeout for in-flight
    /// connections, abort the rest, and release the listener.
    pub async fn shutdown(&mut self) {
        if self.state == ServiceState::Unbound {
            return;
        }
        info!(service = %self.name, "shutting down overlay service");
        self.state = ServiceState::ShuttingDown;
        self.cancel.cancel();

        if let Some(task) = self.accept_task.take() {
            match task.await {
                Ok(mut connections) => {
                    if !connections.is_empty() {
                        info!(
                            service = %self.name,
                            active = connections.len(),
                            "waiting for active connections"
                        );
                    }
                    let drained = tokio::time::timeout(self.drain_timeout, async {
                        while connections.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!(
                            service = %self.name,
                            remaining = connections.len(),
                            "forcefully closing connections"
                        );
                        connections.shutdown().await;
                    }
                }
                Err(err) => warn!(service = %self.name, %err, "accept task failed"),
            }
        }

        self.listener = None;
        self.context = None;
        self.cancel = CancellationToken::new();
        self.state = ServiceState::Unbound;
        info!(service = %self.name, "overlay service shut down");
    }
}

impl Drop for OverlayService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
