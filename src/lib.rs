//! # Mediaflow
//!
//! A durable step-pipeline engine for long-running media production jobs.
//!
//! Media work (encoding, chunked transcription, speech synthesis) runs as
//! multi-step pipelines that must survive process restarts, partial
//! failures and slow external calls. Mediaflow's engine executes named
//! steps in order, memoizes every completed step in a [`StepStore`], and
//! applies per-step retry, backoff and timeout policies - so replaying a
//! run after a crash never repeats finished work.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::{JobInput, Pipeline, RetryPolicy, Step, StepError};
//!
//! let pipeline = Pipeline::new("my_pipeline")
//!     .start_with(FetchAudio)
//!     .then(Transcode)
//!     .then(Publish)
//!     .with_retry(RetryPolicy::exponential(3))
//!     .with_store(store)
//!     .build();
//!
//! let outcome = pipeline.run(job).await?;
//! ```
//!
//! ## The fixed media pipelines
//!
//! Three ready-made compositions live in [`media`]: encode-only,
//! transcribe-only, and combined processing (chunk + encode + transcribe +
//! merge). They reach external systems only through the capability traits
//! in [`capability`], so backends are swappable at run start.
//!
//! ## Durable job queue
//!
//! The [`runner`] module adds an at-least-once job queue on top: submit a
//! job, let the poll loop claim and execute it, and rely on step
//! memoization to make post-crash replays cheap.
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite-backed step store and job queue

pub mod capability;
pub mod media;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod step;
pub mod store;

pub use capability::{
    AudioSource, BlobStore, Capabilities, Chunk, EncodeOutput, Encoder, Synthesizer, Transcriber,
    Transcript,
};
pub use media::{
    ChunkResult, EncodeFormat, EncodeJob, EncodeOutcome, PipelineKind, ProcessingJob,
    ProcessingOutcome, TranscribeJob, TranscribeOutcome, encode_pipeline, processing_pipeline,
    transcribe_pipeline,
};
pub use merge::{MergedResult, TranscribedChunk};
pub use pipeline::{BuiltPipeline, JobInput, Pipeline, PipelineError};
pub use progress::{NoopProgress, ProgressSink};
pub use retry::RetryPolicy;
pub use runner::{ErasedPipeline, JobError, JobId, JobQueue, QueuedJob, Runner, RunnerBuilder};
pub use scheduler::{SchedulerError, process_batches};
pub use step::{Step, StepError};
pub use store::{MemoryStepStore, RunOutcome, RunRecord, RunStatus, StepRecord, StepStore};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStepStore;

#[cfg(feature = "sqlite")]
pub use runner::SqliteJobQueue;
