//! Bounded-concurrency batch scheduler.
//!
//! Processes an ordered sequence of independent work items in consecutive
//! batches of `concurrency` workers, so peak concurrent external calls are
//! capped while every item still gets processed. Output order always equals
//! input order, regardless of which worker finishes first.

use futures::future::try_join_all;
use std::future::Future;
use thiserror::Error;

/// Error from a batch scheduling operation.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A worker failed; the whole operation is abandoned. Retrying the
    /// containing step re-runs every batch from scratch.
    #[error("worker for item {index} failed: {source}")]
    Worker {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Run `worker` over every item with at most `concurrency` in flight.
///
/// Items are split into consecutive batches of `concurrency`; within a
/// batch all workers run concurrently and the batch completes before the
/// next one starts. Any worker failure fails the whole call. Results are
/// sorted by the item's input index before being returned, so downstream
/// consumers see a deterministic order even though completion order is not.
///
/// # Panics
///
/// Panics if `concurrency` is 0.
pub async fn process_batches<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    worker: F,
) -> Result<Vec<R>, SchedulerError>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = anyhow::Result<R>> + Send,
{
    assert!(concurrency > 0, "batch concurrency must be at least 1");

    let mut indexed: Vec<(usize, R)> = Vec::with_capacity(items.len());
    let mut batch = Vec::with_capacity(concurrency);

    let mut iter = items.into_iter().enumerate().peekable();
    while iter.peek().is_some() {
        batch.clear();
        for (index, item) in iter.by_ref().take(concurrency) {
            let fut = worker(index, item);
            batch.push(async move {
                match fut.await {
                    Ok(result) => Ok((index, result)),
                    Err(source) => Err(SchedulerError::Worker { index, source }),
                }
            });
        }
        indexed.extend(try_join_all(batch.drain(..)).await?);
    }

    // Completion order within a batch is not input order; make it so.
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, result)| result).collect())
}
