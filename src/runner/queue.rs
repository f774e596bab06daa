//! Job queue contract and types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Queue-assigned identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub i64);

/// A claimed job, ready for dispatch to its pipeline.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    /// Registered pipeline name this job targets.
    pub pipeline: String,
    pub input: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Failures surfaced by the queue and the runner.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("run failed: {0}")]
    Run(String),
}

/// Storage backend holding pending and in-flight jobs.
///
/// A job moves pending -> running -> completed/failed. Claiming must be
/// atomic so concurrent runners never dispatch the same job twice.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job targeting the named pipeline.
    async fn enqueue(&self, pipeline: &str, input: serde_json::Value) -> Result<JobId, JobError>;

    /// Atomically move up to `limit` pending jobs to running and return them.
    async fn claim(&self, limit: usize) -> Result<Vec<QueuedJob>, JobError>;

    /// Move jobs stuck in running back to pending, returning how many.
    ///
    /// Runners call this once at startup. A recovered job replays its
    /// pipeline; memoized steps make that replay cheap.
    async fn recover_orphans(&self) -> Result<usize, JobError> {
        Ok(0)
    }

    /// Mark a job completed.
    async fn complete(&self, id: JobId) -> Result<(), JobError>;

    /// Mark a job failed, keeping the error message.
    async fn fail(&self, id: JobId, error: &str) -> Result<(), JobError>;
}
