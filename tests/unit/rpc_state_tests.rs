use agent_loopd::ipc::protocol::{
    parse_event_names, parse_request, parse_server_message, ServerMessage, INVALID_PARAMS,
    INVALID_REQUEST, PARSE_ERROR,
};
use agent_loopd::ipc::{OutputBuffer, RpcSessionState, StateUpdate};
use serde_json::{json, Map, Value};

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("params must be an object"),
    }
}

#[test]
fn zero_capacity_buffer_holds_nothing() {
    let mut buf = OutputBuffer::new(0);
    buf.push("line".into());
    assert!(buf.is_empty());
}

#[test]
fn buffer_keeps_most_recent_lines_in_order() {
    let mut buf = OutputBuffer::new(3);
    for i in 0..10 {
        buf.push(format!("line {i}"));
    }
    assert_eq!(buf.len(), 3);
    assert_eq!(buf.lines(), vec!["line 7", "line 8", "line 9"]);
}

#[test]
fn apply_reports_only_changed_fields() {
    let mut state = RpcSessionState::new("build", "/work/build", "opencode", 10, 5);
    let diff = state.apply(StateUpdate {
        iteration: Some(2),
        current_story: Some("STORY-1".into()),
        status: Some("running".into()),
        max_iterations: None,
    });

    assert_eq!(diff.len(), 2);
    assert_eq!(diff["iteration"], 2);
    assert_eq!(diff["current_story"], "STORY-1");
    assert_eq!(state.iteration, 2);
}

#[test]
fn status_payload_has_expected_shape() {
    let mut state = RpcSessionState::new("build", "/work/build", "opencode", 10, 5);
    state.output.push("hello".into());
    state.interactive_mode = true;

    let value = state.to_json();
    assert_eq!(value["task_name"], "build");
    assert_eq!(value["max_iterations"], 10);
    assert_eq!(value["status"], "running");
    assert_eq!(value["mode_indicator"], "interactive");
    assert_eq!(value["recent_output"], json!(["hello"]));
    assert!(value["current_story"].is_null());
}

#[test]
fn parse_request_classifies_failures() {
    let err = parse_request("{not json").expect_err("parse error");
    assert_eq!(err.error.expect("error").code, PARSE_ERROR);

    let err = parse_request("[1,2]").expect_err("not an object");
    assert_eq!(err.error.expect("error").code, INVALID_REQUEST);

    let err = parse_request(r#"{"jsonrpc":"1.0","id":3,"method":"x"}"#).expect_err("version");
    assert_eq!(err.error.expect("error").code, INVALID_REQUEST);
    assert!(err.id.is_some(), "id is echoed when present");

    let err = parse_request(r#"{"jsonrpc":"2.0","id":4}"#).expect_err("missing method");
    assert_eq!(err.error.expect("error").code, INVALID_REQUEST);
}

#[test]
fn parse_request_accepts_notifications() {
    let request = parse_request(r#"{"jsonrpc":"2.0","method":"stop"}"#).expect("valid");
    assert!(request.is_notification());
    assert!(request.params.is_empty());
}

#[test]
fn event_names_are_validated_as_a_whole() {
    let names = parse_event_names(&params(json!({ "events": ["output", "*"] }))).expect("valid");
    assert_eq!(names.len(), 2);

    let err = parse_event_names(&params(json!({ "events": ["output", "bogus"] })))
        .expect_err("unknown event");
    assert_eq!(err.code, INVALID_PARAMS);
    assert!(err.message.contains("bogus"));

    let err = parse_event_names(&params(json!({ "events": "output" }))).expect_err("not a list");
    assert_eq!(err.code, INVALID_PARAMS);

    assert!(parse_event_names(&Map::new()).expect("absent").is_empty());
}

#[test]
fn server_messages_are_told_apart() {
    let notification =
        parse_server_message(r#"{"jsonrpc":"2.0","method":"event","params":{"type":"output"}}"#)
            .expect("notification");
    assert!(matches!(notification, ServerMessage::Notification(n) if n.method == "event"));

    let response = parse_server_message(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).expect("response");
    assert!(matches!(response, ServerMessage::Response(_)));
}
