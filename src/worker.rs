//! Background workers draining the local job queue.

use crate::dispatcher::LocalDispatcher;
use crate::orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A fixed number of workers pulling jobs from a [`LocalDispatcher`].
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<LocalDispatcher>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<LocalDispatcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    /// Run until the token is cancelled.
    ///
    /// Besides the workers, a sweeper periodically re-submits pending
    /// records once the queue runs dry and removes orphaned scratch.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(workers = self.concurrency, "worker pool started");

        let mut handles = Vec::with_capacity(self.concurrency + 1);
        for worker in 0..self.concurrency {
            let orchestrator = Arc::clone(&self.orchestrator);
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker, orchestrator, queue, cancel).await;
            }));
        }

        let poll = Duration::from_millis(self.orchestrator.config().workers.poll_interval_ms);
        let orchestrator = Arc::clone(&self.orchestrator);
        let queue = Arc::clone(&self.queue);
        let sweeper_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_sweeper(orchestrator, queue, poll, sweeper_cancel).await;
        }));

        futures::future::join_all(handles).await;
        tracing::info!("worker pool stopped");
    }

    /// Process queued jobs one at a time until the queue is empty,
    /// including jobs queued while draining. Returns how many ran.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.queue.try_next() {
            if let Err(e) = self.orchestrator.run_encoding(job.encoding_id).await {
                tracing::error!(encoding_id = %job.encoding_id, error = %e, "job failed to run");
            }
            ran += 1;
        }
        ran
    }
}

async fn run_worker(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<LocalDispatcher>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.next() => job,
        };

        let run = orchestrator.run_encoding(job.encoding_id);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => {
                if let Err(e) = result {
                    tracing::error!(worker, encoding_id = %job.encoding_id, error = %e, "job failed to run");
                }
            }
            _ = cancel.cancelled() => {
                // Dropping the run kills its encoder and untracks it.
                tracing::info!(worker, encoding_id = %job.encoding_id, "shutdown while encoding, job left for recovery");
                break;
            }
        }
    }
    tracing::debug!(worker, "worker stopped");
}

async fn run_sweeper(
    orchestrator: Arc<Orchestrator>,
    queue: Arc<LocalDispatcher>,
    poll: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => break,
        }

        // Only an empty queue can be missing pending work.
        if queue.is_empty() {
            if let Err(e) = orchestrator.requeue_pending().await {
                tracing::error!(error = %e, "requeueing pending jobs failed");
            }
        }
        if let Err(e) = orchestrator.sweep_orphans() {
            tracing::error!(error = %e, "orphan sweep failed");
        }
    }
}
