//! Integration tests for the SQLite step store, the job queue, and the
//! runner loop on top of them.

#![cfg(feature = "sqlite")]

use async_trait::async_trait;
use mediaflow::{
    MemoryStepStore, Pipeline, RunOutcome, RunStatus, RunnerBuilder, SqliteJobQueue,
    SqliteStepStore, Step, StepError, StepStore,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Install a fmt subscriber once so `RUST_LOG` surfaces runner logs.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Tag {
    name: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Step for Tag {
    type Input = String;
    type Output = String;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, input: String) -> Result<String, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{input}>{}", self.name))
    }
}

async fn sqlite_store() -> SqliteStepStore {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteStepStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

#[tokio::test]
async fn step_store_round_trips_runs_and_steps() {
    let store = sqlite_store().await;

    let run = store
        .start_run("run-1", "encode", Some("task-9"))
        .await
        .unwrap();
    assert_eq!(run.run_id, "run-1");
    assert_eq!(run.pipeline, "encode");
    assert_eq!(run.status, RunStatus::Processing);
    assert_eq!(run.task_id.as_deref(), Some("task-9"));

    store.start_step("run-1", "split", 0).await.unwrap();
    store
        .record_attempt("run-1", "split", 1, "backend unavailable")
        .await
        .unwrap();
    store
        .record_success("run-1", "split", 2, &json!({"chunks": 4}))
        .await
        .unwrap();

    let step = store.load_step("run-1", "split").await.unwrap().unwrap();
    assert_eq!(step.step_name, "split");
    assert_eq!(step.attempts, 2);
    assert!(step.succeeded());
    assert_eq!(step.payload, Some(json!({"chunks": 4})));
    assert_eq!(step.last_error.as_deref(), Some("backend unavailable"));

    store
        .complete_run(
            "run-1",
            RunOutcome::Done {
                result: json!({"ok": true}),
            },
        )
        .await
        .unwrap();

    let run = store.load_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn start_run_returns_existing_terminal_record() {
    let store = sqlite_store().await;

    store.start_run("run-2", "encode", None).await.unwrap();
    store
        .complete_run(
            "run-2",
            RunOutcome::Failed {
                step: "split".to_string(),
                error: "unrecoverable".to_string(),
            },
        )
        .await
        .unwrap();

    // A re-submission must see the failed record, not a fresh one.
    let run = store.start_run("run-2", "encode", None).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step.as_deref(), Some("split"));
    assert_eq!(run.error.as_deref(), Some("unrecoverable"));
}

#[tokio::test]
async fn replay_against_sqlite_skips_memoized_steps() {
    let store = Arc::new(sqlite_store().await);

    // Pretend a previous process crashed after finishing step "one".
    store.start_run("job-7", "ops", None).await.unwrap();
    store.start_step("job-7", "one", 0).await.unwrap();
    store
        .record_success("job-7", "one", 1, &json!("job-7>one"))
        .await
        .unwrap();

    let one_calls = Arc::new(AtomicU32::new(0));
    let two_calls = Arc::new(AtomicU32::new(0));

    let pipeline = Pipeline::new("ops")
        .start_with(Tag {
            name: "one",
            calls: one_calls.clone(),
        })
        .then(Tag {
            name: "two",
            calls: two_calls.clone(),
        })
        .with_store(store.clone())
        .build();

    let out = pipeline.run("job-7".to_string()).await.unwrap();
    assert_eq!(out, "job-7>one>two");
    assert_eq!(one_calls.load(Ordering::SeqCst), 0);
    assert_eq!(two_calls.load(Ordering::SeqCst), 1);

    let run = store.load_run("job-7").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
}

#[tokio::test]
async fn multibyte_attempt_errors_are_clipped_on_a_char_boundary() {
    let store = sqlite_store().await;

    store.start_run("run-3", "encode", None).await.unwrap();
    store.start_step("run-3", "split", 0).await.unwrap();

    // 1999 ASCII bytes put the clip limit inside the first two-byte char.
    let noisy = format!("{}{}", "x".repeat(1999), "é".repeat(200));
    store
        .record_attempt("run-3", "split", 1, &noisy)
        .await
        .unwrap();

    let step = store.load_step("run-3", "split").await.unwrap().unwrap();
    let stored = step.last_error.unwrap();
    assert!(stored.len() <= 2000);
    assert!(stored.ends_with('x'));
    assert!(noisy.starts_with(&stored));
}

#[tokio::test]
async fn queue_claims_each_job_once() {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(pool);
    queue.run_migrations().await.unwrap();

    use mediaflow::JobQueue;

    let id = queue.enqueue("encode", json!({"episode_id": "e1"})).await.unwrap();

    let claimed = queue.claim(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].pipeline, "encode");
    assert_eq!(claimed[0].input, json!({"episode_id": "e1"}));

    // Already claimed; nothing left to hand out.
    assert!(queue.claim(10).await.unwrap().is_empty());

    queue.complete(id).await.unwrap();
    assert_eq!(queue.recover_orphans().await.unwrap(), 0);
}

#[tokio::test]
async fn orphaned_jobs_are_reclaimed_after_recovery() {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(pool);
    queue.run_migrations().await.unwrap();

    use mediaflow::JobQueue;

    let id = queue.enqueue("encode", json!({})).await.unwrap();
    assert_eq!(queue.claim(1).await.unwrap().len(), 1);

    // Simulate a crash mid-execution: the job is stuck in running.
    assert_eq!(queue.recover_orphans().await.unwrap(), 1);

    let reclaimed = queue.claim(1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    queue.fail(id, "gave up").await.unwrap();
    assert_eq!(queue.recover_orphans().await.unwrap(), 0);
}

#[tokio::test]
async fn multibyte_job_errors_are_clipped_on_a_char_boundary() {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(pool.clone());
    queue.run_migrations().await.unwrap();

    use mediaflow::JobQueue;

    let id = queue.enqueue("encode", json!({})).await.unwrap();
    queue.claim(1).await.unwrap();

    let noisy = format!("{}{}", "x".repeat(1999), "é".repeat(5));
    queue.fail(id, &noisy).await.unwrap();

    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT status, error_message FROM mf_jobs LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    let error = error.unwrap();
    assert!(error.len() <= 2000);
    assert!(error.ends_with('x'));
}

#[tokio::test]
async fn runner_executes_submitted_jobs() {
    init_tracing();
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(pool);
    queue.run_migrations().await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::new("ops")
        .start_with(Tag {
            name: "one",
            calls: calls.clone(),
        })
        .with_store(Arc::new(MemoryStepStore::new()))
        .build();

    let runner = RunnerBuilder::new(queue)
        .pipeline(pipeline)
        .poll_interval(Duration::from_millis(20))
        .max_concurrent(2)
        .build();

    runner.submit("ops", "job-a".to_string()).await.unwrap();
    runner.submit("ops", "job-b".to_string()).await.unwrap();

    tokio::select! {
        _ = runner.run() => {}
        _ = tokio::time::sleep(Duration::from_millis(300)) => {}
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn runner_fails_jobs_for_unknown_pipelines() {
    init_tracing();
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(pool.clone());
    queue.run_migrations().await.unwrap();

    let runner = RunnerBuilder::new(queue)
        .poll_interval(Duration::from_millis(20))
        .build();

    runner.submit("nope", json!({})).await.unwrap();

    tokio::select! {
        _ = runner.run() => {}
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }

    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT status, error_message FROM mf_jobs LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(error.unwrap().contains("nope"));
}
