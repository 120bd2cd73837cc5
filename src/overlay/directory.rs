//! Rendezvous-directory overlay provider.
//!
//! The identity file is JSON:
//!
//! ```json
//! {"name": "build-host", "rendezvous_dir": "/shared/overlay", "bind_host": "127.0.0.1"}
//! ```
//!
//! Binding a service opens a TCP listener on `bind_host` and publishes its
//! address as `<rendezvous_dir>/<service>.addr`. Dialing reads that file.
//! Hosts that share the directory (and can route to each other's
//! `bind_host`) reach each other by service name.

use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{OverlayContext, OverlayListener, OverlayNetwork, OverlayStream};
use crate::{AppError, Result};

/// Parsed identity file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DirectoryIdentity {
    /// Identity name.
    pub name: String,
    /// Shared directory where bound services publish their address.
    pub rendezvous_dir: PathBuf,
    /// Interface services listen on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

fn default_bind_host() -> String {
    "127.0.0.1".into()
}

/// Provider backed by a rendezvous directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryOverlay;

impl OverlayNetwork for DirectoryOverlay {
    fn load_identity<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn OverlayContext>>> + Send + 'a>> {
        Box::pin(async move {
            let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
                AppError::Config(format!("cannot read identity {}: {err}", path.display()))
            })?;
            let identity: DirectoryIdentity = serde_json::from_str(&raw).map_err(|err| {
                AppError::Config(format!("invalid identity {}: {err}", path.display()))
            })?;
            if identity.name.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "identity {} has an empty name",
                    path.display()
                )));
            }
            tokio::fs::create_dir_all(&identity.rendezvous_dir).await?;
            info!(identity = %identity.name, "overlay identity loaded");
            Ok(Arc::new(DirectoryContext { identity }) as Arc<dyn OverlayContext>)
        })
    }
}

#[derive(Debug)]
struct DirectoryContext {
    identity: DirectoryIdentity,
}

impl DirectoryContext {
    fn address_file(&self, service: &str) -> PathBuf {
        self.identity
            .rendezvous_dir
            .join(format!("{service}.addr"))
    }

    async fn published(&self, service: &str) -> Option<SocketAddr> {
        let raw = tokio::fs::read_to_string(self.address_file(service))
            .await
            .ok()?;
        raw.trim().parse().ok()
    }
}

impl OverlayContext for DirectoryContext {
    fn identity_name(&self) -> &str {
        &self.identity.name
    }

    fn bind(
        &self,
        service: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OverlayListener>>> + Send + '_>> {
        let service = service.to_owned();
        Box::pin(async move {
            if let Some(addr) = self.published(&service).await {
                if TcpStream::connect(addr).await.is_ok() {
                    return Err(AppError::AlreadyExists(format!(
                        "overlay service {service} is already bound"
                    )));
                }
                debug!(%service, "replacing stale rendezvous entry");
            }

            let listener = TcpListener::bind((self.identity.bind_host.as_str(), 0))
                .await
                .map_err(|err| AppError::Overlay(format!("bind {service} failed: {err}")))?;
            let addr = listener.local_addr()?;

            let path = self.address_file(&service);
            let mut tmp = tempfile::NamedTempFile::new_in(&self.identity.rendezvous_dir)?;
            tmp.write_all(addr.to_string().as_bytes())?;
            tmp.persist(&path)
                .map_err(|err| AppError::Overlay(format!("publish {service} failed: {err}")))?;

            info!(%service, %addr, "overlay service bound");
            Ok(Box::new(DirectoryListener {
                service,
                listener,
                address_file: path,
            }) as Box<dyn OverlayListener>)
        })
    }

    fn dial(
        &self,
        service: &str,
    ) -> Pin<Box<dyn Future<Output = Result<OverlayStream>> + Send + '_>> {
        let service = service.to_owned();
        Box::pin(async move {
            let addr = self.published(&service).await.ok_or_else(|| {
                AppError::NotFound(format!("overlay service {service} is not published"))
            })?;
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|err| AppError::Overlay(format!("dial {service} failed: {err}")))?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as OverlayStream)
        })
    }
}

#[derive(Debug)]
struct DirectoryListener {
    service: String,
    listener: TcpListener,
    address_file: PathBuf,
}

impl OverlayListener for DirectoryListener {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn accept(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<(OverlayStream, String)>> + Send + '_>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as OverlayStream, peer.to_string()))
        })
    }
}

impl Drop for DirectoryListener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.address_file) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(service = %self.service, %err, "failed to unpublish service");
            }
        }
    }
}
