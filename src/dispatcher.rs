//! Job submission.
//!
//! The orchestrator never runs encodes inline: it persists a job record and
//! hands its id to a [`JobDispatcher`]. [`LocalDispatcher`] is an in-process
//! priority queue consumed by [`crate::worker::WorkerPool`].

use async_trait::async_trait;
use parking_lot::Mutex;
use reelforge_common::EncodingId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;

/// Highest resolution in the ladder; priorities count down from here so
/// smaller renditions are picked up first.
const PRIORITY_CEILING: i32 = 4320;

/// Dispatch priority for a target resolution. Lower resolutions rank higher.
pub fn priority_for(resolution: u32) -> i32 {
    PRIORITY_CEILING - resolution.min(PRIORITY_CEILING as u32) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub encoding_id: EncodingId,
    pub priority: i32,
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn submit(&self, job: QueuedJob) -> reelforge_common::Result<()>;
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    job: QueuedJob,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Priority queue with FIFO order among equal priorities.
#[derive(Default)]
pub struct LocalDispatcher {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: QueuedJob) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { job, seq });
        }
        self.notify.notify_one();
    }

    pub fn try_next(&self) -> Option<QueuedJob> {
        self.state.lock().heap.pop().map(|e| e.job)
    }

    /// Wait for the next job.
    pub async fn next(&self) -> QueuedJob {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_next() {
                return job;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobDispatcher for LocalDispatcher {
    async fn submit(&self, job: QueuedJob) -> reelforge_common::Result<()> {
        tracing::debug!(encoding_id = %job.encoding_id, priority = job.priority, "job queued");
        self.push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(priority: i32) -> QueuedJob {
        QueuedJob {
            encoding_id: EncodingId::new(),
            priority,
        }
    }

    #[test]
    fn lower_resolutions_rank_higher() {
        assert!(priority_for(240) > priority_for(720));
        assert!(priority_for(720) > priority_for(2160));
        assert_eq!(priority_for(10_000), 0);
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let queue = LocalDispatcher::new();
        let a = job(1);
        let b = job(5);
        let c = job(5);
        queue.push(a);
        queue.push(b);
        queue.push(c);

        assert_eq!(queue.try_next(), Some(b));
        assert_eq!(queue.try_next(), Some(c));
        assert_eq!(queue.try_next(), Some(a));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn next_is_pending_until_a_job_arrives() {
        let queue = LocalDispatcher::new();
        let mut next = tokio_test::task::spawn(queue.next());
        tokio_test::assert_pending!(next.poll());

        let submitted = job(1);
        queue.push(submitted);
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), submitted);
    }

    #[tokio::test]
    async fn next_wakes_on_submit() {
        let queue = Arc::new(LocalDispatcher::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let submitted = job(3);
        queue.submit(submitted).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, submitted);
    }
}
