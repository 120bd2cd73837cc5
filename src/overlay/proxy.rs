//! Per-session proxy services relaying overlay connections to a local
//! agent-server port.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::relay::relay;
use super::service::{ConnectionHandler, OverlayService};
use super::{OverlayNetwork, OverlayStream};
use crate::orchestrator::agent_server::LOOPBACK_HOST;
use crate::Result;

/// Relays every accepted connection to `127.0.0.1:<target_port>`.
#[derive(Debug, Clone)]
pub struct LoopbackProxy {
    session_id: String,
    target_port: u16,
}

impl LoopbackProxy {
    /// Proxy for `session_id` targeting `target_port`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, target_port: u16) -> Self {
        Self {
            session_id: session_id.into(),
            target_port,
        }
    }
}

impl ConnectionHandler for LoopbackProxy {
    fn handle(
        &self,
        stream: OverlayStream,
        peer: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let local = match TcpStream::connect((LOOPBACK_HOST, self.target_port)).await {
                Ok(local) => local,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                    warn!(
                        session_id = %self.session_id,
                        port = self.target_port,
                        "connection refused on local port, agent-server may be down"
                    );
                    return;
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, %peer, %err, "local connect failed");
                    return;
                }
            };
            if let Err(err) = local.set_nodelay(true) {
                debug!(%err, "set_nodelay failed");
            }
            debug!(session_id = %self.session_id, %peer, port = self.target_port, "proxying");
            match relay(stream, local).await {
                Ok(stats) => debug!(
                    session_id = %self.session_id,
                    %peer,
                    forward = stats.forward,
                    backward = stats.backward,
                    "proxy connection closed"
                ),
                Err(err) => debug!(session_id = %self.session_id, %peer, %err, "proxy connection ended"),
            }
        })
    }
}

/// Service name for a session proxy: `<prefix><task>-<8 hex chars>`.
#[must_use]
pub fn proxy_service_name(prefix: &str, task_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{task_name}-{}", &suffix[..8])
}

/// Tracks one proxy service per active session. Register and deregister
/// are serialized; deregistering twice is a no-op.
#[derive(Debug)]
pub struct ProxyServiceManager {
    network: Arc<dyn OverlayNetwork>,
    identity_path: PathBuf,
    service_prefix: String,
    drain_timeout: Duration,
    services: Mutex<HashMap<String, OverlayService>>,
}

impl ProxyServiceManager {
    /// Manager binding services with the identity at `identity_path`.
    #[must_use]
    pub fn new(
        network: Arc<dyn OverlayNetwork>,
        identity_path: impl Into<PathBuf>,
        service_prefix: impl Into<String>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            network,
            identity_path: identity_path.into(),
            service_prefix: service_prefix.into(),
            drain_timeout,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Bind and start a proxy for `session_id`, returning its service name.
    /// Registering an already-registered session returns the existing name.
    ///
    /// # Errors
    ///
    /// Returns the identity or bind error; nothing is tracked on failure.
    pub async fn register(
        &self,
        session_id: &str,
        task_name: &str,
        target_port: u16,
    ) -> Result<String> {
        let mut services = self.services.lock().await;
        if let Some(existing) = services.get(session_id) {
            warn!(session_id, service = %existing.name(), "proxy already registered");
            return Ok(existing.name().to_owned());
        }

        let name = proxy_service_name(&self.service_prefix, task_name);
        let mut service = OverlayService::new(
            name.clone(),
            self.identity_path.clone(),
            Arc::clone(&self.network),
            Arc::new(LoopbackProxy::new(session_id, target_port)),
            self.drain_timeout,
        );
        service.load_identity().await?;
        service.bind().await?;
        service.start_accepting()?;

        info!(session_id, service = %name, port = target_port, "proxy service registered");
        services.insert(session_id.to_owned(), service);
        Ok(name)
    }

    /// Shut down the proxy for `session_id`, if any.
    pub async fn deregister(&self, session_id: &str) {
        let removed = self.services.lock().await.remove(session_id);
        let Some(mut service) = removed else {
            debug!(session_id, "no proxy service to deregister");
            return;
        };
        service.shutdown().await;
        info!(session_id, "proxy service deregistered");
    }

    /// Service name registered for `session_id`.
    pub async fn service_name(&self, session_id: &str) -> Option<String> {
        self.services
            .lock()
            .await
            .get(session_id)
            .map(|s| s.name().to_owned())
    }

    /// Number of registered proxies.
    pub async fn active_count(&self) -> usize {
        self.services.lock().await.len()
    }

    /// Deregister every proxy, each bounded by `stage_timeout`.
    pub async fn shutdown_all(&self, stage_timeout: Duration) {
        let ids: Vec<String> = self.services.lock().await.keys().cloned().collect();
        info!(count = ids.len(), "shutting down proxy services");
        for id in ids {
            if tokio::time::timeout(stage_timeout, self.deregister(&id))
                .await
                .is_err()
            {
                warn!(session_id = %id, "proxy shutdown timed out");
            }
        }
    }
}
