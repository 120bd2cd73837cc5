//! Time-based purge of finished session records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use agent_loopd::models::session::{ExecutionMode, SessionRecord, SessionStatus};
use agent_loopd::persistence::db;
use agent_loopd::persistence::retention::{purge, spawn_retention_task};
use agent_loopd::persistence::session_repo::SessionRegistry;

async fn seeded_registry() -> SessionRegistry {
    let pool = Arc::new(db::connect_memory().await.expect("in-memory db"));
    let registry = SessionRegistry::new(Arc::clone(&pool));

    for (task, status) in [
        ("old-done", SessionStatus::Completed),
        ("old-failed", SessionStatus::Failed),
        ("old-running", SessionStatus::Running),
        ("fresh-done", SessionStatus::Completed),
    ] {
        let mut record = SessionRecord::new(task, "/tmp", "opencode", ExecutionMode::Terminal, 5);
        record.status = status;
        registry.register(&record).await.expect("register");
    }

    let stale = (Utc::now() - chrono::Duration::days(10)).to_rfc3339();
    sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE task_name LIKE 'old-%'")
        .bind(&stale)
        .execute(pool.as_ref())
        .await
        .expect("age records");
    registry
}

async fn remaining(registry: &SessionRegistry) -> Vec<String> {
    let mut names: Vec<String> = registry
        .list_all()
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.task_name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn purge_removes_only_old_finished_records() {
    let registry = seeded_registry().await;

    let purged = purge(&registry, 7).await.expect("purge");

    assert_eq!(purged, 2);
    assert_eq!(remaining(&registry).await, vec!["fresh-done", "old-running"]);
}

#[tokio::test]
async fn purge_respects_retention_window() {
    let registry = seeded_registry().await;

    assert_eq!(purge(&registry, 30).await.expect("purge"), 0);
    assert_eq!(remaining(&registry).await.len(), 4);
}

#[tokio::test]
async fn retention_task_purges_on_start_and_stops_on_cancel() {
    let registry = seeded_registry().await;
    let cancel = CancellationToken::new();
    let handle = spawn_retention_task(registry.clone(), 7, cancel.clone());

    let mut purged = false;
    for _ in 0..50 {
        if remaining(&registry).await.len() == 2 {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(purged, "first tick runs immediately");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("task exits on cancel")
        .expect("task did not panic");
}
