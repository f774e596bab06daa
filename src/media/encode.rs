//! Encode-only pipeline: validate, encode each requested format, persist
//! the output references.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{EncodeFormat, EncodeJob, PipelineKind};
use crate::capability::{BlobStore, Capabilities, EncodeOutput, Encoder};
use crate::pipeline::{BuiltPipeline, Pipeline, StepChain};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::step::{Step, StepError};
use crate::store::StepStore;

/// Final result of the encode pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeOutcome {
    pub episode_id: String,
    /// One output per requested format, in request order.
    pub outputs: Vec<EncodeOutput>,
    /// Blob key of the persisted output manifest.
    pub manifest_key: String,
}

pub(super) fn validate_formats(formats: &[EncodeFormat]) -> Result<(), StepError> {
    if formats.is_empty() {
        return Err(StepError::invalid(anyhow::anyhow!(
            "at least one output format is required"
        )));
    }
    for f in formats {
        if f.format.is_empty() || f.bitrate == 0 {
            return Err(StepError::invalid(anyhow::anyhow!(
                "malformed format request: '{}' at {} kbit/s",
                f.format,
                f.bitrate
            )));
        }
    }
    Ok(())
}

struct Initialize;

#[async_trait]
impl Step for Initialize {
    type Input = EncodeJob;
    type Output = EncodeJob;

    fn name(&self) -> &'static str {
        "initialize"
    }

    fn description(&self) -> &'static str {
        "validating encode request"
    }

    async fn execute(&self, job: EncodeJob) -> Result<EncodeJob, StepError> {
        if job.source.is_empty() {
            return Err(StepError::invalid(anyhow::anyhow!("empty source reference")));
        }
        validate_formats(&job.formats)?;
        Ok(job)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Encoded {
    job: EncodeJob,
    outputs: Vec<EncodeOutput>,
}

struct EncodeFormats {
    encoder: Arc<dyn Encoder>,
}

#[async_trait]
impl Step for EncodeFormats {
    type Input = EncodeJob;
    type Output = Encoded;

    fn name(&self) -> &'static str {
        "encode_formats"
    }

    fn description(&self) -> &'static str {
        "encoding output formats"
    }

    async fn execute(&self, job: EncodeJob) -> Result<Encoded, StepError> {
        let mut outputs = Vec::with_capacity(job.formats.len());
        for f in &job.formats {
            let output = self
                .encoder
                .encode(&job.source, &f.format, f.bitrate)
                .await
                .map_err(StepError::retryable)?;
            info!(
                episode = %job.episode_id,
                format = %f.format,
                size = output.size,
                "format encoded"
            );
            outputs.push(output);
        }
        Ok(Encoded { job, outputs })
    }
}

struct PersistOutputs {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Step for PersistOutputs {
    type Input = Encoded;
    type Output = EncodeOutcome;

    fn name(&self) -> &'static str {
        "persist_outputs"
    }

    fn description(&self) -> &'static str {
        "persisting encoded output references"
    }

    async fn execute(&self, encoded: Encoded) -> Result<EncodeOutcome, StepError> {
        let manifest_key = format!("episodes/{}/encodings.json", encoded.job.episode_id);
        let manifest = serde_json::to_vec(&encoded.outputs)
            .map_err(|e| StepError::permanent(anyhow::Error::from(e)))?;

        self.blobs
            .put(&manifest_key, &manifest, "application/json")
            .await
            .map_err(StepError::retryable)?;

        Ok(EncodeOutcome {
            episode_id: encoded.job.episode_id,
            outputs: encoded.outputs,
            manifest_key,
        })
    }
}

/// Build the encode-only pipeline against the given capabilities.
pub fn encode_pipeline(
    caps: &Capabilities,
    store: Arc<dyn StepStore>,
    progress: Arc<dyn ProgressSink>,
) -> BuiltPipeline<EncodeJob, EncodeOutcome, impl StepChain<EncodeJob, EncodeOutcome>> {
    Pipeline::new(PipelineKind::Encode.name())
        .start_with(Initialize)
        .then(EncodeFormats {
            encoder: caps.encoder.clone(),
        })
        .then(PersistOutputs {
            blobs: caps.blobs.clone(),
        })
        .with_retry(RetryPolicy::exponential(3))
        .with_store(store)
        .with_progress(progress)
        .build()
}
