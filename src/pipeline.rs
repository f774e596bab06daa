//! Pipeline builder and execution engine.
//!
//! A pipeline is an ordered chain of named steps. The engine executes them
//! strictly in declaration order, memoizing every successful step result in
//! a [`StepStore`] keyed by (run id, step name). Re-running a run id is
//! therefore always safe: completed steps short-circuit to their recorded
//! payloads, which is how a run resumes after a process restart.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::progress::{NoopProgress, ProgressSink};
use crate::retry::RetryPolicy;
use crate::step::{Step, StepError};
use crate::store::{MemoryStepStore, RunOutcome, RunStatus, StepStore};

/// Why a pipeline run stopped.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A step rejected its input. Never retried.
    #[error("step '{step}' rejected its input: {source}")]
    InvalidInput {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A step hit an unrecoverable failure.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A step exhausted its retry budget.
    #[error("step '{step}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        step: &'static str,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The run previously reached the Failed terminal state.
    #[error("run '{run_id}' already failed at step '{step}': {error}")]
    RunAlreadyFailed {
        run_id: String,
        step: String,
        error: String,
    },

    /// A step output could not be serialized for memoization.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The step store failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// The step this failure is attributed to, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { step, .. }
            | Self::StepFailed { step, .. }
            | Self::RetriesExhausted { step, .. } => Some(step),
            Self::RunAlreadyFailed { step, .. } => Some(step),
            Self::Payload(_) | Self::Store(_) => None,
        }
    }
}

/// Trait for pipeline inputs that identify their run.
pub trait JobInput {
    /// Opaque run identifier. Memoized state is keyed by it.
    fn run_id(&self) -> String;

    /// External task id, stored on the run for progress correlation only.
    fn task_id(&self) -> Option<String> {
        None
    }
}

impl JobInput for String {
    fn run_id(&self) -> String {
        self.clone()
    }
}

/// Per-run execution context threaded through the step chain.
#[doc(hidden)]
pub struct StepContext<'a> {
    run_id: &'a str,
    store: &'a dyn StepStore,
    progress: &'a dyn ProgressSink,
    default_retry: &'a RetryPolicy,
    total_steps: u32,
}

impl StepContext<'_> {
    /// Best-effort progress report; failures are logged and swallowed.
    async fn report(&self, index: u32, message: &str) {
        let percent = (((index + 1) * 100) / self.total_steps.max(1)).min(100) as u8;
        if let Err(e) = self.progress.report(self.run_id, percent, message).await {
            warn!(run_id = self.run_id, error = %e, "progress report failed");
        }
    }
}

/// Object-safe view of a step, used by the chain types.
#[doc(hidden)]
#[async_trait]
pub trait BoxedStep<I, O>: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn retry_policy(&self) -> Option<RetryPolicy>;
    fn timeout(&self) -> Option<Duration>;
    fn fallback(&self, input: I) -> Option<O>;
    async fn execute(&self, input: I) -> Result<O, StepError>;
}

/// Adapts any [`Step`] to the object-safe view.
#[doc(hidden)]
pub struct StepWrapper<S>(pub S);

#[async_trait]
impl<S> BoxedStep<S::Input, S::Output> for StepWrapper<S>
where
    S: Step,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn description(&self) -> &'static str {
        self.0.description()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.0.retry_policy()
    }

    fn timeout(&self) -> Option<Duration> {
        self.0.timeout()
    }

    fn fallback(&self, input: S::Input) -> Option<S::Output> {
        self.0.fallback(input)
    }

    async fn execute(&self, input: S::Input) -> Result<S::Output, StepError> {
        self.0.execute(input).await
    }
}

/// An ordered sequence of steps taking `I` to `O`.
#[doc(hidden)]
#[async_trait]
pub trait StepChain<I, O>: Send + Sync {
    async fn run(
        &self,
        input: I,
        cx: &StepContext<'_>,
        start_index: u32,
    ) -> Result<O, PipelineError>;

    /// How many steps this chain contains.
    fn step_count(&self) -> u32;
}

/// The empty chain; passes its input through.
#[doc(hidden)]
pub struct Identity;

#[async_trait]
impl<T: Send + 'static> StepChain<T, T> for Identity {
    async fn run(
        &self,
        input: T,
        _cx: &StepContext<'_>,
        _start_index: u32,
    ) -> Result<T, PipelineError> {
        Ok(input)
    }

    fn step_count(&self) -> u32 {
        0
    }
}

/// Chain that runs an inner chain, then one step.
#[doc(hidden)]
pub struct ThenChain<First, S, I, M, O>
where
    First: StepChain<I, M>,
    S: BoxedStep<M, O>,
{
    pub first: First,
    pub step: S,
    pub _phantom: std::marker::PhantomData<fn(I, M) -> O>,
}

#[async_trait]
impl<First, S, I, M, O> StepChain<I, O> for ThenChain<First, S, I, M, O>
where
    I: Send + Sync + Clone + 'static,
    M: Send + Sync + Clone + 'static,
    O: Send + Sync + Serialize + DeserializeOwned + 'static,
    First: StepChain<I, M> + Send + Sync,
    S: BoxedStep<M, O> + Send + Sync,
{
    async fn run(
        &self,
        input: I,
        cx: &StepContext<'_>,
        start_index: u32,
    ) -> Result<O, PipelineError> {
        let mid = self.first.run(input, cx, start_index).await?;
        let index = start_index + self.first.step_count();
        execute_step(&self.step, mid, cx, index).await
    }

    fn step_count(&self) -> u32 {
        self.first.step_count() + 1
    }
}

/// Run one step: memoization check, then attempts with retry, backoff and
/// per-attempt timeout, then (for best-effort steps) the fallback path.
async fn execute_step<S, I, O>(
    step: &S,
    input: I,
    cx: &StepContext<'_>,
    index: u32,
) -> Result<O, PipelineError>
where
    S: BoxedStep<I, O>,
    I: Send + Sync + Clone,
    O: Send + Serialize + DeserializeOwned,
{
    let name = step.name();

    // A recorded payload means this step already succeeded for this run;
    // the body must never run again.
    if let Some(record) = cx.store.load_step(cx.run_id, name).await? {
        if let Some(payload) = record.payload {
            debug!(run_id = cx.run_id, step = name, "step memoized, skipping");
            return Ok(serde_json::from_value(payload)?);
        }
    }

    cx.store.start_step(cx.run_id, name, index).await?;
    let policy = step
        .retry_policy()
        .unwrap_or_else(|| cx.default_retry.clone());

    let mut attempt = 0u32;
    let failure = loop {
        attempt += 1;
        let attempt_result = match step.timeout() {
            Some(limit) => match tokio::time::timeout(limit, step.execute(input.clone())).await {
                Ok(result) => result,
                Err(_) => Err(StepError::retryable(anyhow::anyhow!(
                    "attempt timed out after {limit:?}"
                ))),
            },
            None => step.execute(input.clone()).await,
        };

        match attempt_result {
            Ok(output) => {
                let payload = serde_json::to_value(&output)?;
                cx.store
                    .record_success(cx.run_id, name, attempt, &payload)
                    .await?;
                cx.report(index, step.description()).await;
                return Ok(output);
            }
            Err(StepError::Invalid(e)) => {
                cx.store
                    .record_attempt(cx.run_id, name, attempt, &e.to_string())
                    .await?;
                return Err(PipelineError::InvalidInput {
                    step: name,
                    source: e,
                });
            }
            Err(StepError::Retryable(e)) => {
                cx.store
                    .record_attempt(cx.run_id, name, attempt, &e.to_string())
                    .await?;
                if let Some(delay) = policy.delay_for_attempt(attempt) {
                    warn!(
                        run_id = cx.run_id,
                        step = name,
                        attempt,
                        error = %e,
                        "step attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break PipelineError::RetriesExhausted {
                    step: name,
                    attempts: attempt,
                    source: e,
                };
            }
            Err(StepError::Permanent(e)) => {
                cx.store
                    .record_attempt(cx.run_id, name, attempt, &e.to_string())
                    .await?;
                break PipelineError::StepFailed {
                    step: name,
                    source: e,
                };
            }
        }
    };

    // Best-effort steps log the failure and continue with their fallback.
    // The fallback is memoized too, so a replay skips the step entirely.
    if let Some(output) = step.fallback(input) {
        warn!(
            run_id = cx.run_id,
            step = name,
            error = %failure,
            "non-critical step failed, continuing"
        );
        let payload = serde_json::to_value(&output)?;
        cx.store
            .record_success(cx.run_id, name, attempt, &payload)
            .await?;
        cx.report(index, step.description()).await;
        return Ok(output);
    }

    Err(failure)
}

/// Fluent builder assembling a step chain and its execution settings.
pub struct Pipeline<I, O, Chain>
where
    Chain: StepChain<I, O>,
{
    name: &'static str,
    chain: Chain,
    retry_policy: RetryPolicy,
    store: Arc<dyn StepStore>,
    progress: Arc<dyn ProgressSink>,
    _phantom: std::marker::PhantomData<fn(I) -> O>,
}

impl Pipeline<(), (), Identity> {
    /// Start building a pipeline under the given name.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            chain: Identity,
            retry_policy: RetryPolicy::default(),
            store: Arc::new(MemoryStepStore::new()),
            progress: Arc::new(NoopProgress),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Install the first step; fixes the pipeline's input type.
    pub fn start_with<S>(
        self,
        step: S,
    ) -> Pipeline<S::Input, S::Output, impl StepChain<S::Input, S::Output>>
    where
        S: Step + 'static,
        S::Input: Sync + Clone + 'static,
        S::Output: Sync + Clone + Serialize + DeserializeOwned + 'static,
    {
        Pipeline {
            name: self.name,
            chain: ThenChain {
                first: Identity,
                step: StepWrapper(step),
                _phantom: std::marker::PhantomData,
            },
            retry_policy: self.retry_policy,
            store: self.store,
            progress: self.progress,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<I, O, Chain> Pipeline<I, O, Chain>
where
    I: Send + Sync + Clone + 'static,
    O: Send + Sync + Clone + 'static,
    Chain: StepChain<I, O> + Send + Sync + 'static,
{
    /// Append a step whose input is the current chain output.
    pub fn then<S>(self, step: S) -> Pipeline<I, S::Output, impl StepChain<I, S::Output>>
    where
        S: Step<Input = O> + 'static,
        S::Output: Sync + Clone + Serialize + DeserializeOwned + 'static,
    {
        Pipeline {
            name: self.name,
            chain: ThenChain {
                first: self.chain,
                step: StepWrapper(step),
                _phantom: std::marker::PhantomData,
            },
            retry_policy: self.retry_policy,
            store: self.store,
            progress: self.progress,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Set the default retry policy for steps without their own.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the step store used for memoization and run records.
    pub fn with_store(mut self, store: Arc<dyn StepStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Freeze the chain into a runnable pipeline.
    pub fn build(self) -> BuiltPipeline<I, O, Chain> {
        BuiltPipeline {
            name: self.name,
            chain: self.chain,
            retry_policy: self.retry_policy,
            store: self.store,
            progress: self.progress,
            _phantom: std::marker::PhantomData,
        }
    }
}

/// An assembled pipeline; call [`BuiltPipeline::run`] per job.
pub struct BuiltPipeline<I, O, Chain>
where
    Chain: StepChain<I, O>,
{
    name: &'static str,
    chain: Chain,
    retry_policy: RetryPolicy,
    store: Arc<dyn StepStore>,
    progress: Arc<dyn ProgressSink>,
    _phantom: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, Chain> BuiltPipeline<I, O, Chain>
where
    I: JobInput + Send + Sync + Clone + 'static,
    O: Send + Sync + Serialize + DeserializeOwned + 'static,
    Chain: StepChain<I, O> + Send + Sync,
{
    /// Run the whole chain for one job.
    ///
    /// A run id in a terminal state never executes again: Done runs return
    /// their memoized final result, Failed runs return the recorded
    /// failure. A run interrupted mid-flight replays from the top and
    /// skips every step that already has a recorded payload.
    pub async fn run(&self, input: I) -> Result<O, PipelineError> {
        let run_id = input.run_id();
        let record = self
            .store
            .start_run(&run_id, self.name, input.task_id().as_deref())
            .await?;

        match record.status {
            RunStatus::Done => {
                debug!(run_id = %run_id, "run already done, returning memoized result");
                let payload = record
                    .result
                    .ok_or_else(|| anyhow::anyhow!("done run '{run_id}' has no result payload"))?;
                return Ok(serde_json::from_value(payload)?);
            }
            RunStatus::Failed => {
                return Err(PipelineError::RunAlreadyFailed {
                    run_id,
                    step: record.failed_step.unwrap_or_default(),
                    error: record.error.unwrap_or_default(),
                });
            }
            RunStatus::Pending | RunStatus::Processing => {}
        }

        info!(run_id = %run_id, pipeline = self.name, "starting run");

        let cx = StepContext {
            run_id: &run_id,
            store: self.store.as_ref(),
            progress: self.progress.as_ref(),
            default_retry: &self.retry_policy,
            total_steps: self.chain.step_count(),
        };

        match self.chain.run(input, &cx, 0).await {
            Ok(output) => {
                let result = serde_json::to_value(&output)?;
                self.store
                    .complete_run(&run_id, RunOutcome::Done { result })
                    .await?;
                info!(run_id = %run_id, pipeline = self.name, "run completed");
                Ok(output)
            }
            Err(e) => {
                let step = e.step_name().unwrap_or_default().to_string();
                self.store
                    .complete_run(
                        &run_id,
                        RunOutcome::Failed {
                            step: step.clone(),
                            error: e.to_string(),
                        },
                    )
                    .await?;
                error!(run_id = %run_id, step = %step, error = %e, "run failed");
                Err(e)
            }
        }
    }

    /// The name this pipeline registers under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of steps in this pipeline.
    pub fn step_count(&self) -> u32 {
        self.chain.step_count()
    }
}
