use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use agent_loopd::models::session::{
    ExecutionMode, OverlayInfo, SessionRecord, SessionStatus, Transport,
};
use agent_loopd::persistence::session_repo::{LivenessProbe, SessionRegistry};
use agent_loopd::persistence::{db, schema};
use agent_loopd::AppError;

/// Probe reporting the named tasks as alive.
struct FakeProbe {
    alive: HashSet<String>,
}

impl FakeProbe {
    fn alive(tasks: &[&str]) -> Self {
        Self {
            alive: tasks.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

impl LivenessProbe for FakeProbe {
    fn is_alive<'a>(
        &'a self,
        record: &'a SessionRecord,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move { self.alive.contains(&record.task_name) })
    }
}

async fn registry() -> (SessionRegistry, Arc<db::Database>) {
    let pool = Arc::new(db::connect_memory().await.expect("in-memory db"));
    (SessionRegistry::new(Arc::clone(&pool)), pool)
}

fn terminal(task: &str) -> SessionRecord {
    SessionRecord::new(task, format!("/work/{task}"), "opencode", ExecutionMode::Terminal, 20)
}

fn remote(task: &str) -> SessionRecord {
    SessionRecord::new(task, "/srv/remote", "opencode", ExecutionMode::AgentServer, 20).with_overlay(
        OverlayInfo {
            service_name: Some(format!("loop-session-{task}")),
            identity_path: Some("/id.json".into()),
            remote_host: Some("build-01".into()),
        },
    )
}

#[tokio::test]
async fn register_and_get_round_trip() {
    let (registry, _pool) = registry().await;
    let mut record = terminal("build");
    record.worker_pid = Some(4242);
    record.current_story = Some("STORY-1".into());
    registry.register(&record).await.expect("register");

    let stored = registry.get("build").await.expect("get").expect("present");
    assert_eq!(stored.task_dir, "/work/build");
    assert_eq!(stored.worker_pid, Some(4242));
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.execution_mode, ExecutionMode::Terminal);
    assert_eq!(stored.transport, Transport::Local);
    assert_eq!(stored.max_iterations, 20);
    assert_eq!(stored.current_story.as_deref(), Some("STORY-1"));

    assert!(registry.get("missing").await.expect("get").is_none());
}

#[tokio::test]
async fn claim_running_refuses_live_record() {
    let (registry, _pool) = registry().await;
    registry.claim_running(&terminal("build")).await.expect("first claim");

    let err = registry
        .claim_running(&terminal("build"))
        .await
        .expect_err("second claim conflicts");
    assert!(matches!(err, AppError::SessionAlreadyRunning(task) if task == "build"));
}

#[tokio::test]
async fn claim_running_replaces_finished_record() {
    let (registry, _pool) = registry().await;
    registry.claim_running(&terminal("build")).await.expect("claim");
    registry
        .update_progress("build", 7, Some("STORY-3"))
        .await
        .expect("progress");
    registry
        .update_status("build", SessionStatus::Completed)
        .await
        .expect("complete");

    let mut fresh = terminal("build");
    fresh.worker_pid = Some(99);
    registry.claim_running(&fresh).await.expect("reclaim");

    let stored = registry.get("build").await.expect("get").expect("present");
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.iteration, 0);
    assert_eq!(stored.worker_pid, Some(99));
}

#[tokio::test]
async fn list_all_orders_newest_first() {
    let (registry, _pool) = registry().await;
    let now = Utc::now();
    for (task, age) in [("old", 30), ("newest", 0), ("middle", 10)] {
        let mut record = terminal(task);
        record.started_at = now - Duration::minutes(age);
        registry.register(&record).await.expect("register");
    }

    let names: Vec<String> = registry
        .list_all()
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.task_name)
        .collect();
    assert_eq!(names, vec!["newest", "middle", "old"]);
}

#[tokio::test]
async fn progress_never_moves_backwards() {
    let (registry, _pool) = registry().await;
    registry.register(&terminal("build")).await.expect("register");

    registry.update_progress("build", 5, Some("A")).await.expect("advance");
    registry.update_progress("build", 3, Some("B")).await.expect("stale update");

    let stored = registry.get("build").await.expect("get").expect("present");
    assert_eq!(stored.iteration, 5);
    assert_eq!(stored.current_story.as_deref(), Some("B"));
}

#[tokio::test]
async fn updates_on_unknown_task_are_not_found() {
    let (registry, _pool) = registry().await;

    let err = registry
        .update_status("ghost", SessionStatus::Stopped)
        .await
        .expect_err("no row");
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(matches!(
        registry.update_worker_pid("ghost", 1).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        registry.update_agent_session_id("ghost", "ses").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn agent_session_id_and_pid_are_recorded() {
    let (registry, _pool) = registry().await;
    registry.register(&terminal("build")).await.expect("register");

    registry
        .update_agent_session_id("build", "ses_42")
        .await
        .expect("session id");
    registry.update_worker_pid("build", 777).await.expect("pid");

    let stored = registry.get("build").await.expect("get").expect("present");
    assert_eq!(stored.server.agent_session_id.as_deref(), Some("ses_42"));
    assert_eq!(stored.worker_pid, Some(777));
}

#[tokio::test]
async fn list_running_demotes_dead_local_sessions() {
    let (registry, _pool) = registry().await;
    registry.register(&terminal("alive")).await.expect("register");
    registry.register(&terminal("dead")).await.expect("register");
    let mut done = terminal("done");
    done.status = SessionStatus::Completed;
    registry.register(&done).await.expect("register");

    let running = registry
        .list_running(&FakeProbe::alive(&["alive"]))
        .await
        .expect("list running");

    assert_eq!(running.len(), 1);
    assert_eq!(running[0].task_name, "alive");
    let dead = registry.get("dead").await.expect("get").expect("present");
    assert_eq!(dead.status, SessionStatus::Failed);
    let done = registry.get("done").await.expect("get").expect("present");
    assert_eq!(done.status, SessionStatus::Completed);
}

#[tokio::test]
async fn overlay_records_are_not_probed() {
    let (registry, _pool) = registry().await;
    registry.register(&remote("api")).await.expect("register");

    let record = registry.get("api").await.expect("get").expect("present");
    let reconciled = registry
        .reconcile_liveness(record, &FakeProbe::alive(&[]))
        .await
        .expect("reconcile");

    assert_eq!(reconciled.status, SessionStatus::Running);
    assert_eq!(registry.list_remote().await.expect("remote").len(), 1);
}

#[tokio::test]
async fn reconcile_remote_applies_reported_status() {
    let (registry, _pool) = registry().await;
    registry.register(&remote("api")).await.expect("register");
    registry.register(&terminal("local")).await.expect("register");

    let updated = registry
        .reconcile_remote("api", SessionStatus::Completed)
        .await
        .expect("reconcile")
        .expect("known task");
    assert_eq!(updated.status, SessionStatus::Completed);

    let local = registry
        .reconcile_remote("local", SessionStatus::Failed)
        .await
        .expect("reconcile")
        .expect("known task");
    assert_eq!(local.status, SessionStatus::Running, "local records are ignored");

    assert!(registry
        .reconcile_remote("ghost", SessionStatus::Failed)
        .await
        .expect("reconcile")
        .is_none());
}

#[tokio::test]
async fn remove_reports_whether_row_existed() {
    let (registry, _pool) = registry().await;
    registry.register(&terminal("build")).await.expect("register");

    assert!(registry.remove("build").await.expect("remove"));
    assert!(!registry.remove("build").await.expect("remove again"));
}

#[tokio::test]
async fn purge_deletes_only_old_finished_records() {
    let (registry, pool) = registry().await;
    registry.register(&terminal("old-running")).await.expect("register");
    registry.register(&terminal("old-failed")).await.expect("register");
    registry.register(&terminal("fresh-failed")).await.expect("register");
    for task in ["old-failed", "fresh-failed"] {
        registry
            .update_status(task, SessionStatus::Failed)
            .await
            .expect("fail");
    }

    let stale = (Utc::now() - Duration::days(40)).to_rfc3339();
    sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE task_name LIKE 'old-%'")
        .bind(&stale)
        .execute(pool.as_ref())
        .await
        .expect("age records");

    let purged = registry
        .purge_terminal(Utc::now() - Duration::days(30))
        .await
        .expect("purge");

    assert_eq!(purged, 1);
    assert!(registry.get("old-failed").await.expect("get").is_none());
    assert!(registry.get("old-running").await.expect("get").is_some());
    assert!(registry.get("fresh-failed").await.expect("get").is_some());
}

#[tokio::test]
async fn legacy_registry_is_migrated_in_place() {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").expect("options");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("pool");
    sqlx::raw_sql(
        "CREATE TABLE sessions (
            task_name TEXT PRIMARY KEY NOT NULL,
            task_dir TEXT NOT NULL,
            pid INTEGER,
            agent TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            iteration INTEGER NOT NULL DEFAULT 0,
            max_iterations INTEGER NOT NULL DEFAULT 0,
            current_story TEXT
        );",
    )
    .execute(&pool)
    .await
    .expect("legacy table");
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO sessions (task_name, task_dir, pid, agent, status, started_at, updated_at, iteration, max_iterations)
         VALUES ('legacy', '/old', 12, 'claude', 'completed', ?1, ?1, 4, 10)",
    )
    .bind(&now)
    .execute(&pool)
    .await
    .expect("legacy row");

    schema::migrate(&pool).await.expect("migrate");
    schema::migrate(&pool).await.expect("migrate is idempotent");
    let added = schema::add_column(&pool, "remote_host", "TEXT")
        .await
        .expect("column added by another process is not an error");
    assert!(!added);

    let registry = SessionRegistry::new(Arc::new(pool));
    let record = registry.get("legacy").await.expect("get").expect("present");
    assert_eq!(record.execution_mode, ExecutionMode::Terminal);
    assert_eq!(record.transport, Transport::Local);
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.iteration, 4);
    assert!(record.server.port.is_none());
}
