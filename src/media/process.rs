//! Combined processing pipeline.
//!
//! Splits the source into overlapping chunks, encodes the full source to
//! the requested formats, transcribes every chunk through the bounded-batch
//! scheduler, cleans up the temporary chunk resources best-effort, merges
//! the chunk transcripts and persists the result. Chunk count and time
//! ranges flow from the split step into the merge; they are never
//! recomputed from transcripts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::encode::validate_formats;
use super::{PipelineKind, ProcessingJob, TRANSCRIBE_CONCURRENCY};
use crate::capability::{
    AudioSource, BlobStore, Capabilities, Chunk, EncodeOutput, Encoder, Transcriber,
};
use crate::merge::{self, MergedResult, TranscribedChunk};
use crate::pipeline::{BuiltPipeline, Pipeline, StepChain};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::scheduler::process_batches;
use crate::step::{Step, StepError};
use crate::store::StepStore;

/// Per-chunk transcription output, tagged with the originating index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub index: usize,
    pub text: String,
}

/// Final result of the combined processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub episode_id: String,
    pub outputs: Vec<EncodeOutput>,
    pub transcript_key: String,
    pub text: String,
    pub word_count: usize,
}

struct Initialize;

#[async_trait]
impl Step for Initialize {
    type Input = ProcessingJob;
    type Output = ProcessingJob;

    fn name(&self) -> &'static str {
        "initialize"
    }

    fn description(&self) -> &'static str {
        "validating processing request"
    }

    async fn execute(&self, job: ProcessingJob) -> Result<ProcessingJob, StepError> {
        if job.source.is_empty() {
            return Err(StepError::invalid(anyhow::anyhow!("empty source reference")));
        }
        if job.language.is_empty() {
            return Err(StepError::invalid(anyhow::anyhow!("empty language code")));
        }
        if job.chunk_secs <= 0.0 {
            return Err(StepError::invalid(anyhow::anyhow!(
                "chunk duration must be positive, got {}",
                job.chunk_secs
            )));
        }
        if job.overlap_secs < 0.0 || job.overlap_secs >= job.chunk_secs {
            return Err(StepError::invalid(anyhow::anyhow!(
                "overlap ({}) must be non-negative and shorter than the chunk ({})",
                job.overlap_secs,
                job.chunk_secs
            )));
        }
        validate_formats(&job.formats)?;
        Ok(job)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkPlan {
    job: ProcessingJob,
    chunks: Vec<Chunk>,
}

struct SplitChunks {
    encoder: Arc<dyn Encoder>,
}

#[async_trait]
impl Step for SplitChunks {
    type Input = ProcessingJob;
    type Output = ChunkPlan;

    fn name(&self) -> &'static str {
        "split_chunks"
    }

    fn description(&self) -> &'static str {
        "splitting source into overlapping chunks"
    }

    async fn execute(&self, job: ProcessingJob) -> Result<ChunkPlan, StepError> {
        let chunks = self
            .encoder
            .split(&job.source, job.chunk_secs, job.overlap_secs)
            .await
            .map_err(StepError::retryable)?;
        // The merge divides by chunk length; a zero-length chunk can never
        // merge, so reject it here instead of burning retries downstream.
        if let Some(bad) = chunks.iter().find(|chunk| chunk.duration() <= 0.0) {
            return Err(StepError::permanent(anyhow::anyhow!(
                "encoder returned a zero-length chunk at index {}",
                bad.index
            )));
        }
        info!(episode = %job.episode_id, chunks = chunks.len(), "source split");
        Ok(ChunkPlan { job, chunks })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Encoded {
    plan: ChunkPlan,
    outputs: Vec<EncodeOutput>,
}

struct EncodeFormats {
    encoder: Arc<dyn Encoder>,
}

#[async_trait]
impl Step for EncodeFormats {
    type Input = ChunkPlan;
    type Output = Encoded;

    fn name(&self) -> &'static str {
        "encode_formats"
    }

    fn description(&self) -> &'static str {
        "encoding output formats"
    }

    async fn execute(&self, plan: ChunkPlan) -> Result<Encoded, StepError> {
        let mut outputs = Vec::with_capacity(plan.job.formats.len());
        for f in &plan.job.formats {
            let output = self
                .encoder
                .encode(&plan.job.source, &f.format, f.bitrate)
                .await
                .map_err(StepError::retryable)?;
            outputs.push(output);
        }
        Ok(Encoded { plan, outputs })
    }
}

struct PersistEncodings {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for PersistEncodings {
    type Input = Encoded;
    type Output = Encoded;

    fn name(&self) -> &'static str {
        "persist_encodings"
    }

    fn description(&self) -> &'static str {
        "persisting encoded output references"
    }

    async fn execute(&self, encoded: Encoded) -> Result<Encoded, StepError> {
        let key = format!("episodes/{}/encodings.json", encoded.plan.job.episode_id);
        let manifest = serde_json::to_vec(&encoded.outputs)
            .map_err(|e| StepError::permanent(anyhow::Error::from(e)))?;
        self.blobs
            .put(&key, &manifest, "application/json")
            .await
            .map_err(StepError::retryable)?;
        Ok(encoded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunksTranscribed {
    plan: ChunkPlan,
    outputs: Vec<EncodeOutput>,
    results: Vec<ChunkResult>,
}

struct TranscribeChunks {
    transcriber: Arc<dyn Transcriber>,
}

#[async_trait]
impl Step for TranscribeChunks {
    type Input = Encoded;
    type Output = ChunksTranscribed;

    fn name(&self) -> &'static str {
        "transcribe_chunks"
    }

    fn description(&self) -> &'static str {
        "transcribing chunks"
    }

    async fn execute(&self, encoded: Encoded) -> Result<ChunksTranscribed, StepError> {
        let language = encoded.plan.job.language.clone();
        let source = encoded.plan.job.source.clone();
        let transcriber = self.transcriber.clone();

        // A single chunk failure fails the batch set; the engine's retry
        // policy for this step decides whether to redo it from scratch.
        let results = process_batches(
            encoded.plan.chunks.clone(),
            TRANSCRIBE_CONCURRENCY,
            |index, chunk| {
                let transcriber = transcriber.clone();
                let language = language.clone();
                let resource = chunk.resource.clone().unwrap_or_else(|| source.clone());
                async move {
                    let transcript = transcriber
                        .transcribe(AudioSource::Reference(resource), &language)
                        .await?;
                    Ok(ChunkResult {
                        index,
                        text: transcript.text,
                    })
                }
            },
        )
        .await
        .map_err(StepError::retryable)?;

        Ok(ChunksTranscribed {
            plan: encoded.plan,
            outputs: encoded.outputs,
            results,
        })
    }
}

struct CleanupChunks {
    encoder: Arc<dyn Encoder>,
}

#[async_trait]
impl Step for CleanupChunks {
    type Input = ChunksTranscribed;
    type Output = ChunksTranscribed;

    fn name(&self) -> &'static str {
        "cleanup_chunks"
    }

    fn description(&self) -> &'static str {
        "cleaning up temporary chunk resources"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::None)
    }

    // Leaked temp resources are not worth failing the run over.
    fn fallback(&self, input: ChunksTranscribed) -> Option<ChunksTranscribed> {
        Some(input)
    }

    async fn execute(&self, input: ChunksTranscribed) -> Result<ChunksTranscribed, StepError> {
        self.encoder
            .discard(&input.plan.chunks)
            .await
            .map_err(StepError::retryable)?;
        Ok(input)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Merged {
    job: ProcessingJob,
    outputs: Vec<EncodeOutput>,
    merged: MergedResult,
}

struct MergeTranscripts;

#[async_trait]
impl Step for MergeTranscripts {
    type Input = ChunksTranscribed;
    type Output = Merged;

    fn name(&self) -> &'static str {
        "merge_transcripts"
    }

    fn description(&self) -> &'static str {
        "merging chunk transcripts"
    }

    async fn execute(&self, input: ChunksTranscribed) -> Result<Merged, StepError> {
        if input.results.len() != input.plan.chunks.len() {
            return Err(StepError::permanent(anyhow::anyhow!(
                "chunk/result count mismatch: {} chunks, {} results",
                input.plan.chunks.len(),
                input.results.len()
            )));
        }

        let transcribed: Vec<TranscribedChunk> = input
            .plan
            .chunks
            .iter()
            .zip(&input.results)
            .map(|(chunk, result)| TranscribedChunk {
                index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                text: result.text.clone(),
            })
            .collect();

        let merged = merge::merge(&transcribed, input.plan.job.overlap_secs);
        Ok(Merged {
            job: input.plan.job,
            outputs: input.outputs,
            merged,
        })
    }
}

struct PersistTranscript {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for PersistTranscript {
    type Input = Merged;
    type Output = ProcessingOutcome;

    fn name(&self) -> &'static str {
        "persist_transcript"
    }

    fn description(&self) -> &'static str {
        "persisting merged transcript"
    }

    async fn execute(&self, merged: Merged) -> Result<ProcessingOutcome, StepError> {
        let transcript_key = format!("episodes/{}/transcript.txt", merged.job.episode_id);
        self.blobs
            .put(&transcript_key, merged.merged.text.as_bytes(), "text/plain")
            .await
            .map_err(StepError::retryable)?;

        Ok(ProcessingOutcome {
            episode_id: merged.job.episode_id,
            outputs: merged.outputs,
            transcript_key,
            text: merged.merged.text,
            word_count: merged.merged.word_count,
        })
    }
}

/// Build the combined processing pipeline against the given capabilities.
pub fn processing_pipeline(
    caps: &Capabilities,
    store: Arc<dyn StepStore>,
    progress: Arc<dyn ProgressSink>,
) -> BuiltPipeline<ProcessingJob, ProcessingOutcome, impl StepChain<ProcessingJob, ProcessingOutcome>>
{
    Pipeline::new(PipelineKind::CombinedProcessing.name())
        .start_with(Initialize)
        .then(SplitChunks {
            encoder: caps.encoder.clone(),
        })
        .then(EncodeFormats {
            encoder: caps.encoder.clone(),
        })
        .then(PersistEncodings {
            blobs: caps.blobs.clone(),
        })
        .then(TranscribeChunks {
            transcriber: caps.transcriber.clone(),
        })
        .then(CleanupChunks {
            encoder: caps.encoder.clone(),
        })
        .then(MergeTranscripts)
        .then(PersistTranscript {
            blobs: caps.blobs.clone(),
        })
        .with_retry(RetryPolicy::exponential(3))
        .with_store(store)
        .with_progress(progress)
        .build()
}
