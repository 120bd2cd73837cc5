//! Overlay services over the directory provider: binding, proxying,
//! forwarding.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use agent_loopd::overlay::proxy::LoopbackProxy;
use agent_loopd::overlay::{
    DirectoryOverlay, LocalForwarder, OverlayNetwork, OverlayService, ProxyServiceManager,
    ServiceState,
};
use agent_loopd::AppError;

use super::test_helpers::write_identity;

const DRAIN: Duration = Duration::from_secs(1);

/// Echo server on an ephemeral loopback port. Each connection echoes until
/// the client half-closes.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    port
}

/// Send `payload`, half-close, and collect everything echoed back.
async fn echo_round_trip<S>(stream: S, payload: Vec<u8>) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let send = async move {
        writer.write_all(&payload).await.expect("send");
        writer.shutdown().await.expect("half-close");
    };
    let receive = async move {
        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.expect("receive");
        echoed
    };
    let ((), echoed) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(send, receive)
    })
    .await
    .expect("round trip in time");
    echoed
}

fn payload() -> Vec<u8> {
    (0..=250_u8).cycle().take(100 * 1024).collect()
}

fn manager(dir: &Path) -> ProxyServiceManager {
    let identity = write_identity(dir, "host-a", &dir.join("rendezvous"));
    ProxyServiceManager::new(Arc::new(DirectoryOverlay), identity, "loop-session-", DRAIN)
}

#[tokio::test]
async fn proxy_relays_bytes_both_ways() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = spawn_echo_server().await;
    let proxies = manager(dir.path());

    let service = proxies.register("s1", "api", port).await.expect("register");
    assert!(service.starts_with("loop-session-api-"));

    let client_identity = write_identity(dir.path(), "laptop", &dir.path().join("rendezvous"));
    let context = DirectoryOverlay
        .load_identity(&client_identity)
        .await
        .expect("client identity");
    let stream = context.dial(&service).await.expect("dial proxy");

    let sent = payload();
    let echoed = echo_round_trip(stream, sent.clone()).await;
    assert_eq!(echoed.len(), sent.len());
    assert!(echoed == sent, "payload corrupted in transit");

    proxies.shutdown_all(DRAIN).await;
    assert_eq!(proxies.active_count().await, 0);
}

#[tokio::test]
async fn register_is_idempotent_and_deregister_twice_is_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = spawn_echo_server().await;
    let proxies = manager(dir.path());

    let first = proxies.register("s1", "api", port).await.expect("register");
    let again = proxies.register("s1", "api", port).await.expect("re-register");
    assert_eq!(first, again);
    assert_eq!(proxies.active_count().await, 1);
    assert_eq!(proxies.service_name("s1").await.as_deref(), Some(first.as_str()));

    proxies.deregister("s1").await;
    proxies.deregister("s1").await;
    assert_eq!(proxies.active_count().await, 0);
    assert!(proxies.service_name("s1").await.is_none());
    assert!(
        !dir.path().join("rendezvous").join(format!("{first}.addr")).exists(),
        "service is unpublished"
    );
}

#[tokio::test]
async fn register_with_missing_identity_tracks_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let proxies = ProxyServiceManager::new(
        Arc::new(DirectoryOverlay),
        dir.path().join("missing.json"),
        "loop-session-",
        DRAIN,
    );

    let err = proxies.register("s1", "api", 1).await.expect_err("no identity");
    assert!(matches!(err, AppError::Config(_)));
    assert_eq!(proxies.active_count().await, 0);
}

#[tokio::test]
async fn bind_requires_loaded_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = write_identity(dir.path(), "host-a", &dir.path().join("rendezvous"));
    let mut service = OverlayService::new(
        "loop-control-host-a",
        identity,
        Arc::new(DirectoryOverlay),
        Arc::new(LoopbackProxy::new("s1", 1)),
        DRAIN,
    );

    let err = service.bind().await.expect_err("identity not loaded");
    assert!(matches!(err, AppError::Overlay(_)));
    assert_eq!(service.state(), ServiceState::Unbound);

    service.load_identity().await.expect("identity");
    service.bind().await.expect("bind");
    assert!(service.is_bound());
    let err = service.bind().await.expect_err("second bind");
    assert!(matches!(err, AppError::AlreadyExists(_)));

    service.start_accepting().expect("accepting");
    assert_eq!(service.state(), ServiceState::Accepting);
    service.shutdown().await;
    assert_eq!(service.state(), ServiceState::Unbound);
}

#[tokio::test]
async fn live_service_name_cannot_be_bound_twice() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rendezvous = dir.path().join("rendezvous");
    let identity = write_identity(dir.path(), "host-a", &rendezvous);
    let context = DirectoryOverlay
        .load_identity(&identity)
        .await
        .expect("identity");

    let listener = context.bind("loop-control-host-a").await.expect("first bind");
    let err = context
        .bind("loop-control-host-a")
        .await
        .expect_err("name is live");
    assert!(matches!(err, AppError::AlreadyExists(_)));

    drop(listener);
    let rebound = context.bind("loop-control-host-a").await;
    assert!(rebound.is_ok(), "released name can be bound again");
}

#[tokio::test]
async fn dialing_unknown_service_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = write_identity(dir.path(), "laptop", &dir.path().join("rendezvous"));
    let context = DirectoryOverlay
        .load_identity(&identity)
        .await
        .expect("identity");

    let err = context
        .dial("loop-session-ghost-00000000")
        .await
        .err()
        .expect("not published");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn local_forwarder_reaches_remote_service() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = spawn_echo_server().await;
    let proxies = manager(dir.path());
    let service = proxies.register("s1", "api", port).await.expect("register");

    let client_identity = write_identity(dir.path(), "laptop", &dir.path().join("rendezvous"));
    let context = DirectoryOverlay
        .load_identity(&client_identity)
        .await
        .expect("client identity");
    let mut forwarder = LocalForwarder::start(context, &service)
        .await
        .expect("forwarder");
    assert_eq!(forwarder.service(), service);
    assert_eq!(forwarder.url(), format!("http://{}", forwarder.local_addr()));

    let local = TcpStream::connect(forwarder.local_addr())
        .await
        .expect("connect forwarder");
    let echoed = echo_round_trip(local, b"hello over the overlay".to_vec()).await;
    assert_eq!(echoed, b"hello over the overlay");

    forwarder.shutdown().await;
    assert!(TcpStream::connect(forwarder.local_addr()).await.is_err());
    proxies.shutdown_all(DRAIN).await;
}
