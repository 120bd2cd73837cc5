//! Per-session control socket: request dispatch, subscriptions, framing.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::tokio::Stream;
use interprocess::local_socket::{GenericFilePath, ToFsName};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use agent_loopd::config::RpcConfig;
use agent_loopd::ipc::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
use agent_loopd::ipc::{ControlRpcServer, LoopHooks, RpcClient, RpcSessionState, StateUpdate};

/// Hooks remembering every call.
#[derive(Debug, Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl LoopHooks for RecordingHooks {
    fn on_stop(&self) {
        self.calls.lock().unwrap().push("stop".into());
    }

    fn on_checkpoint(&self) {
        self.calls.lock().unwrap().push("checkpoint".into());
    }

    fn on_interactive_mode(&self, enabled: bool) {
        self.calls.lock().unwrap().push(format!("interactive:{enabled}"));
    }

    fn on_write_pty(&self, data: &str) {
        self.calls.lock().unwrap().push(format!("pty:{data}"));
    }
}

fn start_server(dir: &Path, config: &RpcConfig) -> (ControlRpcServer, Arc<RecordingHooks>) {
    let hooks = Arc::new(RecordingHooks::default());
    let state = RpcSessionState::new("build", "/work/build", "opencode", 10, config.output_buffer);
    let server = ControlRpcServer::new(state, hooks.clone(), config);
    server.start(&dir.join("build.sock")).expect("server starts");
    (server, hooks)
}

async fn raw_connect(
    path: &Path,
) -> (
    impl tokio::io::AsyncBufRead + Unpin,
    impl tokio::io::AsyncWrite + Unpin,
) {
    let name = path.to_fs_name::<GenericFilePath>().expect("socket name");
    let stream = Stream::connect(name).await.expect("connect");
    let (reader, writer) = stream.split();
    (BufReader::new(reader), writer)
}

async fn read_json<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("response in time")
        .expect("read line");
    serde_json::from_str(&line).expect("json line")
}

#[tokio::test]
async fn get_status_reports_session_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    server.append_output("compiling");
    server.update_state(StateUpdate {
        iteration: Some(3),
        current_story: Some("STORY-2".into()),
        ..StateUpdate::default()
    });

    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");
    let status = client.request("get_status", json!({})).await.expect("status");

    assert_eq!(status["task_name"], "build");
    assert_eq!(status["iteration"], 3);
    assert_eq!(status["current_story"], "STORY-2");
    assert_eq!(status["mode_indicator"], "autonomous");
    assert_eq!(status["recent_output"], json!(["compiling"]));
    server.stop().await;
}

#[tokio::test]
async fn subscribers_receive_matching_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");
    let mut events = client.take_events().expect("event stream");

    let subscribed = client
        .request("subscribe", json!({ "events": ["output"] }))
        .await
        .expect("subscribe");
    assert_eq!(subscribed["subscribed"], json!(["output"]));

    server.update_state(StateUpdate {
        iteration: Some(1),
        ..StateUpdate::default()
    });
    server.append_output("line one");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.method, "event");
    assert_eq!(event.params["type"], "output", "state changes were not subscribed");
    assert_eq!(event.params["data"]["line"], "line one");
    server.stop().await;
}

#[tokio::test]
async fn each_subscriber_gets_only_its_event_types() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("build.sock");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());

    let output_client = RpcClient::connect(&socket).await.expect("connect");
    let mut output_events = output_client.take_events().expect("event stream");
    output_client
        .request("subscribe", json!({ "events": ["output"] }))
        .await
        .expect("subscribe output");

    let state_client = RpcClient::connect(&socket).await.expect("connect");
    let mut state_events = state_client.take_events().expect("event stream");
    state_client
        .request("subscribe", json!({ "events": ["state_change"] }))
        .await
        .expect("subscribe state");

    server.append_output("line one");
    let event = tokio::time::timeout(Duration::from_secs(5), output_events.recv())
        .await
        .expect("output event in time")
        .expect("output event");
    assert_eq!(event.params["type"], "output");
    assert!(
        tokio::time::timeout(Duration::from_millis(300), state_events.recv())
            .await
            .is_err(),
        "state_change subscriber saw an output event"
    );

    server.update_state(StateUpdate {
        iteration: Some(2),
        ..StateUpdate::default()
    });
    let event = tokio::time::timeout(Duration::from_secs(5), state_events.recv())
        .await
        .expect("state event in time")
        .expect("state event");
    assert_eq!(event.params["type"], "state_change");
    server.stop().await;
}

#[tokio::test]
async fn invalid_subscription_leaves_existing_set_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");

    client
        .request("subscribe", json!({ "events": ["state_change"] }))
        .await
        .expect("subscribe");
    let resp = client
        .call("subscribe", json!({ "events": ["output", "bogus"] }))
        .await
        .expect("answered");
    assert_eq!(resp.error.expect("rejected").code, INVALID_PARAMS);

    let current = client
        .request("unsubscribe", json!({ "events": [] }))
        .await
        .expect("unsubscribe nothing");
    assert_eq!(current["subscribed"], json!(["state_change"]));
    server.stop().await;
}

#[tokio::test]
async fn interactive_mode_gates_pty_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");

    let ignored = client
        .request("write_pty", json!({ "data": "ls\n" }))
        .await
        .expect("write_pty");
    assert_eq!(ignored["status"], "ignored");

    client
        .request("set_interactive_mode", json!({ "enabled": true }))
        .await
        .expect("enable");
    assert!(server.interactive_mode());
    let forwarded = client
        .request("write_pty", json!({ "data": "ls\n" }))
        .await
        .expect("write_pty");
    assert_eq!(forwarded["status"], "forwarded");

    assert_eq!(hooks.calls(), vec!["interactive:true", "pty:ls\n"]);
    server.stop().await;
}

#[tokio::test]
async fn injected_prompt_is_consumed_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");

    let resp = client
        .call("inject_prompt", json!({ "prompt": "   " }))
        .await
        .expect("answered");
    assert_eq!(resp.error.expect("blank prompt").code, INVALID_PARAMS);

    client
        .request("inject_prompt", json!({ "prompt": "focus on tests" }))
        .await
        .expect("inject");
    assert_eq!(server.take_injected_prompt().as_deref(), Some("focus on tests"));
    assert_eq!(server.take_injected_prompt(), None);
    server.stop().await;
}

#[tokio::test]
async fn stop_and_checkpoint_call_hooks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");

    let checkpoint = client.request("checkpoint", json!({})).await.expect("checkpoint");
    assert_eq!(checkpoint["status"], "checkpoint_requested");
    let stop = client.request("stop", json!({})).await.expect("stop");
    assert_eq!(stop["status"], "stop_requested");

    assert_eq!(hooks.calls(), vec!["checkpoint", "stop"]);
    server.stop().await;
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&dir.path().join("build.sock"))
        .await
        .expect("connect");

    let resp = client.call("reboot", json!({})).await.expect("answered");
    let err = resp.error.expect("error");
    assert_eq!(err.code, METHOD_NOT_FOUND);
    assert!(err.message.contains("reboot"));
    server.stop().await;
}

#[tokio::test]
async fn oversize_line_is_rejected_and_connection_survives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RpcConfig {
        max_line_bytes: 128,
        ..RpcConfig::default()
    };
    let (server, _hooks) = start_server(dir.path(), &config);
    let (mut reader, mut writer) = raw_connect(&dir.path().join("build.sock")).await;

    let oversize = format!("{}\n", "x".repeat(1024));
    writer.write_all(oversize.as_bytes()).await.expect("write");
    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"get_status\"}\n")
        .await
        .expect("write");

    let rejected = read_json(&mut reader).await;
    assert_eq!(rejected["error"]["code"], PARSE_ERROR);
    assert!(rejected["id"].is_null());

    let answered = read_json(&mut reader).await;
    assert_eq!(answered["id"], 1);
    assert_eq!(answered["result"]["task_name"], "build");
    server.stop().await;
}

#[tokio::test]
async fn invalid_utf8_line_is_rejected_and_connection_survives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let (mut reader, mut writer) = raw_connect(&dir.path().join("build.sock")).await;

    writer.write_all(b"\xff\xfe\n").await.expect("write");
    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"get_status\"}\n")
        .await
        .expect("write");

    let rejected = read_json(&mut reader).await;
    assert_eq!(rejected["error"]["code"], PARSE_ERROR);
    assert!(rejected["id"].is_null());

    let answered = read_json(&mut reader).await;
    assert_eq!(answered["id"], 2);
    assert_eq!(answered["result"]["task_name"], "build");
    server.stop().await;
}

#[tokio::test]
async fn notifications_get_no_response() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, hooks) = start_server(dir.path(), &RpcConfig::default());
    let (mut reader, mut writer) = raw_connect(&dir.path().join("build.sock")).await;

    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"checkpoint\"}\n")
        .await
        .expect("write");
    writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"no_such_method\"}\n")
        .await
        .expect("write");
    writer
        .write_all(b"not json\n{\"jsonrpc\":\"2.0\",\"id\":\"req-7\",\"method\":\"get_status\"}\n")
        .await
        .expect("write");

    let parse_error = read_json(&mut reader).await;
    assert_eq!(parse_error["error"]["code"], PARSE_ERROR);
    let answered = read_json(&mut reader).await;
    assert_eq!(answered["id"], "req-7");
    assert_eq!(hooks.calls(), vec!["checkpoint"]);
    server.stop().await;
}

#[tokio::test]
async fn stop_removes_socket_and_disconnects_clients() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("build.sock");
    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&socket).await.expect("connect");
    client.request("get_status", json!({})).await.expect("status");
    assert_eq!(server.subscriber_count(), 1);

    server.stop().await;

    assert!(!socket.exists());
    assert!(client
        .with_timeout(Duration::from_secs(2))
        .request("get_status", json!({}))
        .await
        .is_err());
    assert!(RpcClient::connect(&socket).await.is_err());
}

#[tokio::test]
async fn start_replaces_stale_socket_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("build.sock");
    std::fs::write(&socket, b"stale").expect("stale file");

    let (server, _hooks) = start_server(dir.path(), &RpcConfig::default());
    let client = RpcClient::connect(&socket).await.expect("connect");
    assert!(client.request("get_status", json!({})).await.is_ok());
    assert!(server.start(&socket).is_err(), "second start is refused");
    server.stop().await;
}
