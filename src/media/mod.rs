//! The fixed media-production pipelines.
//!
//! Three compositions over the step engine: encode-only, transcribe-only,
//! and the combined chunk + encode + transcribe + merge pipeline. Each is a
//! concrete, named step sequence; callers pick one via [`PipelineKind`] and
//! submit a job carrying the episode id, source reference and parameters.

mod encode;
mod process;
mod transcribe;

pub use encode::{EncodeOutcome, encode_pipeline};
pub use process::{ChunkResult, ProcessingOutcome, processing_pipeline};
pub use transcribe::{TranscribeOutcome, transcribe_pipeline};

use serde::{Deserialize, Serialize};

use crate::pipeline::JobInput;

/// How many chunk transcriptions run concurrently per batch.
pub const TRANSCRIBE_CONCURRENCY: usize = 3;

/// Which fixed pipeline a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Encode,
    Transcribe,
    CombinedProcessing,
}

impl PipelineKind {
    /// The registered pipeline name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Encode => "encode",
            Self::Transcribe => "transcribe",
            Self::CombinedProcessing => "process",
        }
    }
}

/// One requested output encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeFormat {
    /// Container/codec name, e.g. "mp3" or "aac".
    pub format: String,
    /// Target bitrate in kbit/s.
    pub bitrate: u32,
}

/// Input for the encode-only pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeJob {
    pub episode_id: String,
    /// Reference to the source audio.
    pub source: String,
    pub formats: Vec<EncodeFormat>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl JobInput for EncodeJob {
    fn run_id(&self) -> String {
        format!("encode-{}", self.episode_id)
    }

    fn task_id(&self) -> Option<String> {
        self.task_id.clone()
    }
}

/// Input for the transcribe-only pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeJob {
    pub episode_id: String,
    pub source: String,
    pub language: String,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl JobInput for TranscribeJob {
    fn run_id(&self) -> String {
        format!("transcribe-{}", self.episode_id)
    }

    fn task_id(&self) -> Option<String> {
        self.task_id.clone()
    }
}

/// Input for the combined processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub episode_id: String,
    pub source: String,
    pub formats: Vec<EncodeFormat>,
    /// Chunk window length in seconds.
    pub chunk_secs: f64,
    /// Time shared between consecutive chunks, in seconds.
    pub overlap_secs: f64,
    pub language: String,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl JobInput for ProcessingJob {
    fn run_id(&self) -> String {
        format!("process-{}", self.episode_id)
    }

    fn task_id(&self) -> Option<String> {
        self.task_id.clone()
    }
}
