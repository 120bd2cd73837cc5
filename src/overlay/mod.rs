//! Overlay network reachability.
//!
//! A host binds named services on an identity-based overlay network. The
//! daemon binds one control service per host and one proxy service per
//! remotely reachable session; clients dial those names without knowing
//! where the host lives.
//!
//! The network itself sits behind [`OverlayNetwork`] so the service layer
//! does not depend on a particular provider. [`directory::DirectoryOverlay`]
//! is the built-in provider.

pub mod control;
pub mod directory;
pub mod proxy;
pub mod relay;
pub mod remote;
pub mod service;

use std::fmt::Debug;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

pub use control::OverlayControlService;
pub use directory::DirectoryOverlay;
pub use proxy::ProxyServiceManager;
pub use remote::{LocalForwarder, RemoteDaemonClient};
pub use service::{OverlayService, ServiceState};

/// Byte stream carried over the overlay.
pub trait OverlayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayIo for T {}

/// A connected overlay stream.
pub type OverlayStream = Box<dyn OverlayIo>;

/// An overlay provider.
pub trait OverlayNetwork: Send + Sync + Debug {
    /// Load the identity credential at `path`.
    fn load_identity<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn OverlayContext>>> + Send + 'a>>;
}

/// An authenticated session on the overlay.
pub trait OverlayContext: Send + Sync + Debug {
    /// Name of the loaded identity.
    fn identity_name(&self) -> &str;

    /// Host a service under `service`.
    fn bind(
        &self,
        service: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OverlayListener>>> + Send + '_>>;

    /// Connect to `service`.
    fn dial(&self, service: &str)
        -> Pin<Box<dyn Future<Output = Result<OverlayStream>> + Send + '_>>;
}

/// A bound service accepting overlay connections.
pub trait OverlayListener: Send + Debug {
    /// Service this listener hosts.
    fn service_name(&self) -> &str;

    /// Wait for the next connection and a description of its peer.
    fn accept(&mut self) -> Pin<Box<dyn Future<Output = Result<(OverlayStream, String)>> + Send + '_>>;
}
