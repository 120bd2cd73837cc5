//! Agent-server HTTP client against an in-process fake server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use agent_loopd::agent_api::{AgentApiClient, SessionActivity};
use agent_loopd::config::AgentServerConfig;
use agent_loopd::AppError;

const TIMEOUT: Duration = Duration::from_secs(5);

/// What the fake server saw.
#[derive(Debug, Default)]
struct Seen {
    bodies: Vec<(String, Value)>,
    directories: Vec<String>,
    authorization: Vec<String>,
}

type Shared = Arc<Mutex<Seen>>;

fn record(
    seen: &Shared,
    route: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Value,
) {
    let mut seen = seen.lock().unwrap();
    seen.bodies.push((route.to_owned(), body));
    if let Some(dir) = query.get("directory") {
        seen.directories.push(dir.clone());
    }
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        seen.authorization.push(auth.to_str().unwrap().to_owned());
    }
}

const EVENTS: &str = "event: session.updated\ndata: {}\n\n\
event: session.idle\ndata: {\"sessionID\":\"ses_other\"}\n\n\
event: session.idle\ndata: {\"sessionID\":\"ses_1\"}\n\n";

async fn spawn_server(ct: CancellationToken) -> (String, Shared) {
    let seen: Shared = Arc::default();
    let app = Router::new()
        .route(
            "/session",
            post(
                |State(seen): State<Shared>,
                 Query(query): Query<HashMap<String, String>>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    record(&seen, "create", &query, &headers, body);
                    Json(json!({ "id": "ses_1" }))
                },
            ),
        )
        .route(
            "/session/status",
            get(|| async { Json(json!({ "ses_1": { "type": "busy" } })) }),
        )
        .route(
            "/session/{id}/message",
            get(|| async { Json(json!([{ "id": "m1" }, { "id": "m2" }])) }).post(
                |State(seen): State<Shared>,
                 Path(id): Path<String>,
                 Json(body): Json<Value>| async move {
                    record(&seen, "prompt", &HashMap::new(), &HeaderMap::new(), body);
                    Json(json!({ "session": id, "reply": "done" }))
                },
            ),
        )
        .route(
            "/session/{id}/prompt_async",
            post(|| async { StatusCode::NO_CONTENT }),
        )
        .route(
            "/session/{id}/abort",
            post(|Path(id): Path<String>| async move {
                if id == "ses_1" {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                }
            }),
        )
        .route(
            "/event",
            get(|| async { ([(header::CONTENT_TYPE, "text/event-stream")], EVENTS) }),
        )
        .route(
            "/experimental/worktree",
            post(|Json(body): Json<Value>| async move {
                let name = body["name"].as_str().unwrap_or("generated").to_owned();
                Json(json!({
                    "name": name,
                    "branch": format!("loop/{name}"),
                    "directory": format!("/work/{name}"),
                }))
            })
            .get(|| async { Json(json!(["/work/a", "/work/b"])) })
            .delete(|State(seen): State<Shared>, Json(body): Json<Value>| async move {
                record(&seen, "remove", &HashMap::new(), &HeaderMap::new(), body);
                StatusCode::OK
            }),
        )
        .route(
            "/experimental/worktree/reset",
            post(|| async { (StatusCode::CONFLICT, "dirty worktree").into_response() }),
        )
        .with_state(Arc::clone(&seen));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { ct.cancelled().await })
            .await;
    });
    (format!("http://{addr}/"), seen)
}

fn client(base_url: &str) -> AgentApiClient {
    AgentApiClient::new(reqwest::Client::new(), base_url, TIMEOUT)
}

/// Base URL of a port nothing listens on.
fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    format!("http://{}", listener.local_addr().expect("addr"))
}

#[tokio::test]
async fn create_session_sends_ruleset_directory_and_auth() {
    let ct = CancellationToken::new();
    let (url, seen) = spawn_server(ct.clone()).await;
    let api = client(&url)
        .with_directory("/work/build")
        .with_password(Some("pw".into()));
    assert!(!api.base_url().ends_with('/'));

    let rules = AgentServerConfig::default().permissions;
    let id = api.create_session(&rules).await.expect("create");

    assert_eq!(id, "ses_1");
    let seen = seen.lock().unwrap();
    let (route, body) = &seen.bodies[0];
    assert_eq!(route, "create");
    assert_eq!(body["permission"].as_array().map(Vec::len), Some(rules.len()));
    assert_eq!(body["permission"][0]["action"], "allow");
    assert_eq!(seen.directories, vec!["/work/build".to_owned()]);
    assert_eq!(seen.authorization, vec!["Basic OnB3".to_owned()]);
    ct.cancel();
}

#[tokio::test]
async fn empty_password_sends_no_auth() {
    let ct = CancellationToken::new();
    let (url, seen) = spawn_server(ct.clone()).await;

    client(&url)
        .with_password(Some(String::new()))
        .create_session(&[])
        .await
        .expect("create");

    assert!(seen.lock().unwrap().authorization.is_empty());
    ct.cancel();
}

#[tokio::test]
async fn prompts_and_messages() {
    let ct = CancellationToken::new();
    let (url, seen) = spawn_server(ct.clone()).await;
    let api = client(&url);

    let reply = api
        .send_prompt("ses_1", "write the tests", Some(TIMEOUT))
        .await
        .expect("prompt");
    assert_eq!(reply["reply"], "done");
    let (_, body) = seen.lock().unwrap().bodies[0].clone();
    assert_eq!(body, json!({ "parts": [{ "type": "text", "text": "write the tests" }] }));

    api.send_prompt_async("ses_1", "continue")
        .await
        .expect("async prompt");
    assert_eq!(api.message_count("ses_1").await.expect("messages"), 2);
    ct.cancel();
}

#[tokio::test]
async fn session_status_reads_activity() {
    let ct = CancellationToken::new();
    let (url, _seen) = spawn_server(ct.clone()).await;
    let api = client(&url);

    assert_eq!(api.session_status("ses_1").await, SessionActivity::Busy);
    assert_eq!(api.session_status("ses_absent").await, SessionActivity::Idle);
    assert_eq!(
        client(&dead_url()).session_status("ses_1").await,
        SessionActivity::Unknown
    );
    ct.cancel();
}

#[tokio::test]
async fn wait_for_idle_matches_session() {
    let ct = CancellationToken::new();
    let (url, _seen) = spawn_server(ct.clone()).await;
    let api = client(&url);

    assert!(api
        .wait_for_idle("ses_1", Some(TIMEOUT))
        .await
        .expect("stream opens"));
    assert!(
        !api.wait_for_idle("ses_never", Some(TIMEOUT))
            .await
            .expect("stream opens"),
        "stream ends without a matching idle event"
    );
    assert!(client(&dead_url()).wait_for_idle("ses_1", None).await.is_err());
    ct.cancel();
}

/// Base URL of a server that accepts connections and never answers.
async fn silent_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn wait_for_idle_is_bounded_when_server_never_answers() {
    let url = silent_url().await;

    let started = std::time::Instant::now();
    let idle = client(&url)
        .wait_for_idle("ses_1", Some(Duration::from_millis(300)))
        .await
        .expect("deadline is not an error");
    assert!(!idle);
    assert!(started.elapsed() < Duration::from_secs(3));

    let short = AgentApiClient::new(reqwest::Client::new(), &url, Duration::from_millis(300));
    let err = tokio::time::timeout(Duration::from_secs(3), short.wait_for_idle("ses_1", None))
        .await
        .expect("open is bounded by the request timeout")
        .expect_err("stream never opened");
    assert!(matches!(err, AppError::Http(_)), "{err}");
}

#[tokio::test]
async fn abort_and_health_never_fail() {
    let ct = CancellationToken::new();
    let (url, _seen) = spawn_server(ct.clone()).await;
    let api = client(&url);

    assert!(api.abort("ses_1", TIMEOUT).await);
    assert!(!api.abort("ses_missing", TIMEOUT).await);
    assert!(!api.health(TIMEOUT).await, "fake server has no health route");

    let dead = client(&dead_url());
    assert!(!dead.abort("ses_1", Duration::from_millis(200)).await);
    assert!(!dead.health(Duration::from_millis(200)).await);
    ct.cancel();
}

#[tokio::test]
async fn worktree_operations() {
    let ct = CancellationToken::new();
    let (url, seen) = spawn_server(ct.clone()).await;
    let api = client(&url);

    let worktree = api
        .create_worktree(Some("story-1"), None)
        .await
        .expect("create worktree");
    assert_eq!(worktree.directory, "/work/story-1");
    assert_eq!(worktree.branch, "loop/story-1");

    assert_eq!(
        api.list_worktrees().await.expect("list"),
        vec!["/work/a".to_owned(), "/work/b".to_owned()]
    );

    let err = api
        .reset_worktree("/work/story-1")
        .await
        .expect_err("server refuses");
    assert!(
        matches!(&err, AppError::Http(msg) if msg.contains("409") && msg.contains("dirty worktree")),
        "{err}"
    );

    api.remove_worktree("/work/story-1").await.expect("remove");
    let (route, body) = seen.lock().unwrap().bodies[0].clone();
    assert_eq!(route, "remove");
    assert_eq!(body, json!({ "directory": "/work/story-1" }));
    ct.cancel();
}
