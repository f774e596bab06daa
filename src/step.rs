//! Step trait and error taxonomy.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// How a step attempt failed; decides what the engine does next.
#[derive(Error, Debug)]
pub enum StepError {
    /// Malformed input. Fails the run immediately, never retried.
    #[error("invalid input: {0}")]
    Invalid(#[source] anyhow::Error),

    /// Transient failure, eligible for another attempt.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Failure no retry can fix.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StepError {
    /// Create a validation error. Validation failures consume no retry budget.
    pub fn invalid(err: impl Into<anyhow::Error>) -> Self {
        Self::Invalid(err.into())
    }

    /// Wrap a transient failure.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Wrap a failure that retrying cannot fix.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// One named unit of pipeline work, transforming `Input` to `Output`.
///
/// Step outputs must be serde round-trippable so the engine can memoize
/// them: once a step has succeeded for a given run, a replay of that run
/// deserializes the recorded payload instead of invoking `execute` again.
#[async_trait]
pub trait Step: Send + Sync {
    /// What this step consumes.
    type Input: Send + Clone;

    /// What this step produces.
    type Output: Send;

    /// The name of this step. Unique within a pipeline; memoization key.
    fn name(&self) -> &'static str;

    /// Human-readable text for progress reporting. Defaults to the name.
    fn description(&self) -> &'static str {
        self.name()
    }

    /// Per-step retry policy. `None` uses the pipeline default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Per-attempt timeout. Exceeding it counts as a retryable failure.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Fallback output for best-effort steps.
    ///
    /// Returning `Some` marks the step non-critical: if it fails permanently
    /// or exhausts its retries, the engine logs the error and continues the
    /// run with this value instead of failing. Cleanup steps typically pass
    /// their input through here.
    fn fallback(&self, input: Self::Input) -> Option<Self::Output> {
        let _ = input;
        None
    }

    /// Run the step body.
    async fn execute(&self, input: Self::Input) -> Result<Self::Output, StepError>;
}
