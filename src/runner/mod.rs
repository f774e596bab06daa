//! Durable job queue and runner.
//!
//! Jobs are enqueued as (pipeline name, JSON input) and claimed by a poll
//! loop bounded by a global concurrency limit. Delivery is at-least-once:
//! a job orphaned by a crash is reset to pending on startup and its
//! pipeline replays, with step memoization making the replay cheap.

mod erased;
mod queue;
mod runner;

#[cfg(feature = "sqlite")]
mod sqlite_queue;

pub use erased::ErasedPipeline;
pub use queue::{JobError, JobId, JobQueue, QueuedJob};
pub use runner::{Runner, RunnerBuilder};

#[cfg(feature = "sqlite")]
pub use sqlite_queue::SqliteJobQueue;
