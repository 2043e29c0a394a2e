//! Bounded worker pool for outbound calls; results flow back to a single consumer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A job whose work future panicked; handed back so the caller can record its failure.
#[derive(Debug)]
pub struct JobPanic<J> {
    pub job: J,
    pub message: String,
}

/// One tokio task per client. Workers pull jobs from a shared queue and send outputs
/// back in completion order; the caller drains them with [`WorkerPool::next`].
///
/// Each job runs in its own task, so a panic is reported as [`JobPanic`] and the worker
/// moves on to the next job.
pub struct WorkerPool<J, O> {
    results: mpsc::UnboundedReceiver<Result<O, JobPanic<J>>>,
    tasks: JoinSet<()>,
}

impl<J, O> WorkerPool<J, O>
where
    J: Clone + Send + 'static,
    O: Send + 'static,
{
    pub fn spawn<C, W, Fut>(clients: Vec<C>, jobs: Vec<J>, work: W) -> Self
    where
        C: Send + Sync + 'static,
        W: Fn(Arc<C>, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let (tx, results) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let work = Arc::new(work);
        let mut tasks = JoinSet::new();

        for (worker, client) in clients.into_iter().enumerate() {
            let tx = tx.clone();
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let client = Arc::new(client);
            tasks.spawn(async move {
                let mut handled = 0usize;
                loop {
                    let job = queue.lock().await.pop_front();
                    let Some(job) = job else {
                        break;
                    };
                    let output = tokio::spawn(work(Arc::clone(&client), job.clone()))
                        .await
                        .map_err(|err| {
                            warn!(worker, error = %err, "job panicked");
                            JobPanic {
                                job,
                                message: err.to_string(),
                            }
                        });
                    handled += 1;
                    if tx.send(output).is_err() {
                        break;
                    }
                }
                debug!(worker, handled, "worker finished");
            });
        }

        Self { results, tasks }
    }

    /// Next finished output; `None` once every worker has exited.
    pub async fn next(&mut self) -> Option<Result<O, JobPanic<J>>> {
        self.results.recv().await
    }

    /// Wait for all workers, surfacing failures of the worker tasks themselves.
    pub async fn finish(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined.context("worker task failed")?;
        }
        Ok(())
    }
}

/// Number of workers to start for `jobs` items with a configured ceiling of `max_workers`.
pub fn worker_count(max_workers: usize, jobs: usize) -> usize {
    max_workers.min(jobs).max(1)
}
