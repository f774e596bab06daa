//! Progress reporting interface.
//!
//! Purely observational: the engine reports after each completed step and
//! swallows reporting failures, so a broken sink can never abort an
//! otherwise-successful run.

use async_trait::async_trait;

/// Receives best-effort progress notifications for a run.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Report progress for a run. `percent` is 0..=100.
    async fn report(&self, run_id: &str, percent: u8, message: &str) -> anyhow::Result<()>;
}

/// A sink that discards all progress events.
#[derive(Debug, Clone, Default)]
pub struct NoopProgress;

impl NoopProgress {
    /// Create a new no-op sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _run_id: &str, _percent: u8, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
