//! Transcribe-only pipeline: validate, resolve the source audio, run one
//! whole-source transcription, persist the transcript.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{PipelineKind, TranscribeJob};
use crate::capability::{AudioSource, BlobStore, Capabilities, Transcriber, Transcript};
use crate::pipeline::{BuiltPipeline, Pipeline, StepChain};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::step::{Step, StepError};
use crate::store::StepStore;

/// Final result of the transcribe pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeOutcome {
    pub episode_id: String,
    /// Blob key of the persisted transcript.
    pub transcript_key: String,
    pub text: String,
    pub word_count: usize,
}

struct Initialize;

#[async_trait]
impl Step for Initialize {
    type Input = TranscribeJob;
    type Output = TranscribeJob;

    fn name(&self) -> &'static str {
        "initialize"
    }

    fn description(&self) -> &'static str {
        "validating transcription request"
    }

    async fn execute(&self, job: TranscribeJob) -> Result<TranscribeJob, StepError> {
        if job.source.is_empty() {
            return Err(StepError::invalid(anyhow::anyhow!("empty source reference")));
        }
        if job.language.is_empty() {
            return Err(StepError::invalid(anyhow::anyhow!("empty language code")));
        }
        Ok(job)
    }
}

/// Where the step chain decided the audio lives.
///
/// Only the location is memoized, never the bytes themselves; the
/// transcription step re-reads the blob on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResolvedSource {
    job: TranscribeJob,
    /// Set when the source is present in the blob store under this key.
    blob_key: Option<String>,
}

struct FetchSource {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for FetchSource {
    type Input = TranscribeJob;
    type Output = ResolvedSource;

    fn name(&self) -> &'static str {
        "fetch_source"
    }

    fn description(&self) -> &'static str {
        "resolving source audio"
    }

    async fn execute(&self, job: TranscribeJob) -> Result<ResolvedSource, StepError> {
        let blob_key = match self
            .blobs
            .get(&job.source)
            .await
            .map_err(StepError::retryable)?
        {
            Some(_) => Some(job.source.clone()),
            None => None,
        };
        Ok(ResolvedSource { job, blob_key })
    }
}

struct TranscribeWhole {
    transcriber: Arc<dyn Transcriber>,
    blobs: Arc<dyn BlobStore>,
}

impl TranscribeWhole {
    async fn load_audio(&self, source: &ResolvedSource) -> Result<AudioSource, StepError> {
        match &source.blob_key {
            Some(key) => {
                let bytes = self
                    .blobs
                    .get(key)
                    .await
                    .map_err(StepError::retryable)?
                    .ok_or_else(|| {
                        StepError::retryable(anyhow::anyhow!("blob '{key}' disappeared"))
                    })?;
                Ok(AudioSource::Bytes(bytes))
            }
            None => Ok(AudioSource::Reference(source.job.source.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transcribed {
    job: TranscribeJob,
    transcript: Transcript,
}

#[async_trait]
impl Step for TranscribeWhole {
    type Input = ResolvedSource;
    type Output = Transcribed;

    fn name(&self) -> &'static str {
        "transcribe_source"
    }

    fn description(&self) -> &'static str {
        "transcribing source audio"
    }

    fn timeout(&self) -> Option<Duration> {
        // Whole-source inference over a slow backend; bound each attempt.
        Some(Duration::from_secs(600))
    }

    async fn execute(&self, source: ResolvedSource) -> Result<Transcribed, StepError> {
        let audio = self.load_audio(&source).await?;
        let transcript = self
            .transcriber
            .transcribe(audio, &source.job.language)
            .await
            .map_err(StepError::retryable)?;
        Ok(Transcribed {
            job: source.job,
            transcript,
        })
    }
}

struct PersistTranscript {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for PersistTranscript {
    type Input = Transcribed;
    type Output = TranscribeOutcome;

    fn name(&self) -> &'static str {
        "persist_transcript"
    }

    fn description(&self) -> &'static str {
        "persisting transcript"
    }

    async fn execute(&self, transcribed: Transcribed) -> Result<TranscribeOutcome, StepError> {
        let transcript_key = format!("episodes/{}/transcript.txt", transcribed.job.episode_id);
        let text = transcribed.transcript.text;

        self.blobs
            .put(&transcript_key, text.as_bytes(), "text/plain")
            .await
            .map_err(StepError::retryable)?;

        let word_count = text.split_whitespace().count();
        Ok(TranscribeOutcome {
            episode_id: transcribed.job.episode_id,
            transcript_key,
            text,
            word_count,
        })
    }
}

/// Build the transcribe-only pipeline against the given capabilities.
pub fn transcribe_pipeline(
    caps: &Capabilities,
    store: Arc<dyn StepStore>,
    progress: Arc<dyn ProgressSink>,
) -> BuiltPipeline<TranscribeJob, TranscribeOutcome, impl StepChain<TranscribeJob, TranscribeOutcome>>
{
    Pipeline::new(PipelineKind::Transcribe.name())
        .start_with(Initialize)
        .then(FetchSource {
            blobs: caps.blobs.clone(),
        })
        .then(TranscribeWhole {
            transcriber: caps.transcriber.clone(),
            blobs: caps.blobs.clone(),
        })
        .then(PersistTranscript {
            blobs: caps.blobs.clone(),
        })
        .with_retry(RetryPolicy::exponential(3))
        .with_store(store)
        .with_progress(progress)
        .build()
}
