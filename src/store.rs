//! Durable run and step records.
//!
//! The store is what makes resumption safe: every successful step attempt
//! persists its payload keyed by (run id, step name), and the engine always
//! replays the full pipeline, short-circuiting steps that already have a
//! recorded payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created but no step has started.
    Pending,
    /// Steps are executing (or the process crashed mid-run).
    Processing,
    /// Terminal: completed with a result payload.
    Done,
    /// Terminal: a step failed permanently or exhausted its retries.
    Failed,
}

/// One pipeline execution instance.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Opaque caller-supplied run identifier.
    pub run_id: String,
    /// Name of the pipeline this run executes.
    pub pipeline: String,
    pub status: RunStatus,
    /// Name of the most recently started step.
    pub current_step: Option<String>,
    /// Final output payload. Present only when status is Done.
    pub result: Option<serde_json::Value>,
    /// Name of the failing step. Present only when status is Failed.
    pub failed_step: Option<String>,
    /// Last error message. Present only when status is Failed.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    /// External task id, used purely for progress correlation.
    pub task_id: Option<String>,
}

/// Memoized outcome of one named step within a run.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_name: String,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Result payload. Present if and only if the step succeeded.
    pub payload: Option<serde_json::Value>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl StepRecord {
    /// Returns true if this step has a recorded successful result.
    pub fn succeeded(&self) -> bool {
        self.payload.is_some()
    }
}

/// Terminal outcome recorded when a run finishes.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Done { result: serde_json::Value },
    Failed { step: String, error: String },
}

/// Storage backend for run and step records.
///
/// Keys are append/overwrite-only: runs by run id, steps by
/// (run id, step name). A step record with a payload is immutable.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Create the run if absent and mark it Processing. Returns the record,
    /// which may be a pre-existing terminal one the engine must honor.
    async fn start_run(
        &self,
        run_id: &str,
        pipeline: &str,
        task_id: Option<&str>,
    ) -> anyhow::Result<RunRecord>;

    /// Load a run record, if any.
    async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>>;

    /// Record that a step is starting and update the run's current step.
    async fn start_step(&self, run_id: &str, step: &str, index: u32) -> anyhow::Result<()>;

    /// Load the record for (run id, step name), if any.
    async fn load_step(&self, run_id: &str, step: &str) -> anyhow::Result<Option<StepRecord>>;

    /// Record a failed attempt.
    async fn record_attempt(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        error: &str,
    ) -> anyhow::Result<()>;

    /// Record a successful attempt with its memoized payload.
    async fn record_success(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Record the run's terminal outcome.
    async fn complete_run(&self, run_id: &str, outcome: RunOutcome) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    runs: HashMap<String, RunRecord>,
    steps: HashMap<(String, String), StepRecord>,
}

/// In-memory store for tests and ephemeral runs.
///
/// Memoization works within the process lifetime only; use the SQLite
/// store for crash durability.
#[derive(Debug, Default)]
pub struct MemoryStepStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStepStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn start_run(
        &self,
        run_id: &str,
        pipeline: &str,
        task_id: Option<&str>,
    ) -> anyhow::Result<RunRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunRecord {
                run_id: run_id.to_string(),
                pipeline: pipeline.to_string(),
                status: RunStatus::Pending,
                current_step: None,
                result: None,
                failed_step: None,
                error: None,
                started_at: Utc::now(),
                task_id: task_id.map(str::to_string),
            });
        if record.status == RunStatus::Pending {
            record.status = RunStatus::Processing;
        }
        Ok(record.clone())
    }

    async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
        Ok(self.inner.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn start_step(&self, run_id: &str, step: &str, _index: u32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .steps
            .entry((run_id.to_string(), step.to_string()))
            .or_insert_with(|| StepRecord {
                step_name: step.to_string(),
                attempts: 0,
                payload: None,
                last_error: None,
            });
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.current_step = Some(step.to_string());
        }
        Ok(())
    }

    async fn load_step(&self, run_id: &str, step: &str) -> anyhow::Result<Option<StepRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .steps
            .get(&(run_id.to_string(), step.to_string()))
            .cloned())
    }

    async fn record_attempt(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        error: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .steps
            .entry((run_id.to_string(), step.to_string()))
            .or_insert_with(|| StepRecord {
                step_name: step.to_string(),
                attempts: 0,
                payload: None,
                last_error: None,
            });
        record.attempts = attempt;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn record_success(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .steps
            .entry((run_id.to_string(), step.to_string()))
            .or_insert_with(|| StepRecord {
                step_name: step.to_string(),
                attempts: 0,
                payload: None,
                last_error: None,
            });
        record.attempts = attempt;
        record.payload = Some(payload.clone());
        Ok(())
    }

    async fn complete_run(&self, run_id: &str, outcome: RunOutcome) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.get_mut(run_id) {
            match outcome {
                RunOutcome::Done { result } => {
                    run.status = RunStatus::Done;
                    run.result = Some(result);
                }
                RunOutcome::Failed { step, error } => {
                    run.status = RunStatus::Failed;
                    run.failed_step = Some(step);
                    run.error = Some(error);
                }
            }
        }
        Ok(())
    }
}
