//! Job runner that polls the queue and dispatches to pipelines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::erased::ErasedPipeline;
use super::queue::{JobError, JobId, JobQueue, QueuedJob};

/// A runner that executes queued jobs against registered pipelines.
pub struct Runner<Q: JobQueue> {
    queue: Arc<Q>,
    pipelines: HashMap<&'static str, Arc<dyn ErasedPipeline>>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl<Q: JobQueue + 'static> Runner<Q> {
    /// Serialize `input` and enqueue it for the named pipeline.
    pub async fn submit<T: serde::Serialize>(
        &self,
        pipeline: &str,
        input: T,
    ) -> Result<JobId, JobError> {
        let json =
            serde_json::to_value(input).map_err(|e| JobError::Serialization(e.to_string()))?;
        self.queue.enqueue(pipeline, json).await
    }

    /// Poll, claim and dispatch jobs until the future is dropped.
    pub async fn run(&self) -> ! {
        // Recover any jobs orphaned by a previous crash; their pipeline
        // replays will skip memoized steps.
        match self.queue.recover_orphans().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "recovered orphaned jobs"),
            Err(e) => warn!(error = %e, "orphan recovery failed"),
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            let available = semaphore.available_permits();
            if available > 0 {
                if let Ok(jobs) = self.queue.claim(available).await {
                    for job in jobs {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let queue = self.queue.clone();
                        let pipelines = self.pipelines.clone();

                        tokio::spawn(async move {
                            let result = Self::execute_job(&pipelines, &job).await;
                            match result {
                                Ok(_) => {
                                    let _ = queue.complete(job.id).await;
                                }
                                Err(e) => {
                                    warn!(job = job.id.0, pipeline = %job.pipeline, error = %e, "job failed");
                                    let _ = queue.fail(job.id, &e.to_string()).await;
                                }
                            }
                            drop(permit);
                        });
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn execute_job(
        pipelines: &HashMap<&'static str, Arc<dyn ErasedPipeline>>,
        job: &QueuedJob,
    ) -> Result<serde_json::Value, JobError> {
        let pipeline = pipelines
            .get(job.pipeline.as_str())
            .ok_or_else(|| JobError::UnknownPipeline(job.pipeline.clone()))?;

        pipeline.run_erased(job.input.clone()).await
    }
}

/// Assembles a [`Runner`] from a queue and registered pipelines.
pub struct RunnerBuilder<Q: JobQueue> {
    queue: Q,
    pipelines: HashMap<&'static str, Arc<dyn ErasedPipeline>>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl<Q: JobQueue + 'static> RunnerBuilder<Q> {
    /// Start a builder backed by the given queue.
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            pipelines: HashMap::new(),
            poll_interval: Duration::from_secs(1),
            max_concurrent: 1,
        }
    }

    /// Make a pipeline claimable under its registered name.
    pub fn pipeline(mut self, pipeline: impl ErasedPipeline + 'static) -> Self {
        let name = pipeline.name();
        self.pipelines.insert(name, Arc::new(pipeline));
        self
    }

    /// How often the loop polls for claimable jobs.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cap on jobs executing at once across all pipelines.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Finish building.
    pub fn build(self) -> Runner<Q> {
        Runner {
            queue: Arc::new(self.queue),
            pipelines: self.pipelines,
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
        }
    }
}
