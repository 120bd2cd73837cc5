use agent_loopd::ipc::{LoopHooks, SignalFileHooks};
use agent_loopd::models::signal::SignalKind;
use agent_loopd::orchestrator::signals::SignalStore;

#[test]
fn write_then_take_consumes_signal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SignalStore::new(dir.path().join("signals"));

    store.write("build", SignalKind::Stop).expect("write");
    assert!(store.path("build").exists());

    let signal = store.take("build").expect("pending signal");
    assert_eq!(signal.kind, SignalKind::Stop);
    assert!(!store.path("build").exists());
    assert!(store.take("build").is_none());
}

#[test]
fn later_signal_replaces_earlier() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SignalStore::new(dir.path());

    store.write("build", SignalKind::Checkpoint).expect("write");
    store.write("build", SignalKind::Stop).expect("overwrite");

    assert_eq!(store.take("build").expect("signal").kind, SignalKind::Stop);
}

#[test]
fn malformed_signal_is_discarded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SignalStore::new(dir.path());
    std::fs::write(store.path("build"), b"not json").expect("write garbage");

    assert!(store.take("build").is_none());
    assert!(!store.path("build").exists());
}

#[test]
fn clear_is_quiet_when_nothing_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SignalStore::new(dir.path());

    store.clear("build");
    store.write("build", SignalKind::Stop).expect("write");
    store.clear("build");
    assert!(store.take("build").is_none());
}

#[test]
fn file_hooks_write_signals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SignalStore::new(dir.path());
    let hooks = SignalFileHooks::new(store.clone(), "build");

    hooks.on_checkpoint();
    assert_eq!(store.take("build").expect("signal").kind, SignalKind::Checkpoint);

    hooks.on_stop();
    assert_eq!(store.take("build").expect("signal").kind, SignalKind::Stop);
}
