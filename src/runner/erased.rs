//! JSON-in, JSON-out pipeline dispatch for the runner's registry.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::queue::JobError;
use crate::pipeline::{BuiltPipeline, JobInput, StepChain};

/// A pipeline with its input and output types erased to JSON.
#[async_trait]
pub trait ErasedPipeline: Send + Sync {
    /// Registered name used to route claimed jobs.
    fn name(&self) -> &'static str;

    /// Deserialize the job input, run, and serialize the outcome.
    async fn run_erased(&self, input: serde_json::Value) -> Result<serde_json::Value, JobError>;
}

#[async_trait]
impl<I, O, Chain> ErasedPipeline for BuiltPipeline<I, O, Chain>
where
    I: JobInput + Send + Sync + Clone + DeserializeOwned + 'static,
    O: Send + Sync + Serialize + DeserializeOwned + 'static,
    Chain: StepChain<I, O> + Send + Sync,
{
    fn name(&self) -> &'static str {
        BuiltPipeline::name(self)
    }

    async fn run_erased(&self, input: serde_json::Value) -> Result<serde_json::Value, JobError> {
        let typed_input: I =
            serde_json::from_value(input).map_err(|e| JobError::Deserialization(e.to_string()))?;

        let output = self
            .run(typed_input)
            .await
            .map_err(|e| JobError::Run(e.to_string()))?;

        serde_json::to_value(output).map_err(|e| JobError::Serialization(e.to_string()))
    }
}
