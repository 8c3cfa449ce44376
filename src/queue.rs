//! Queue store — the two in-process FIFO queues between pipeline stages.
//!
//! `Incoming` carries raw items from ingestion to triage; `DeepExtraction`
//! carries triaged leads to the extraction worker. Push and pop never
//! suspend while holding the lock, so each is atomic with respect to the
//! other stages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::pipeline::types::{CompositeJob, RawItem};

/// Which queue a job lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Incoming,
    DeepExtraction,
}

impl QueueId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::DeepExtraction => "deep_extraction",
        }
    }
}

/// Unbounded FIFO of jobs. Ownership of a job moves in on `push` and out on `pop`.
pub struct JobQueue<T> {
    id: QueueId,
    jobs: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> JobQueue<T> {
    pub fn new(id: QueueId) -> Self {
        Self {
            id,
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job at the tail and wake a waiting consumer.
    pub fn push(&self, job: T) {
        let size = {
            let mut jobs = self.lock();
            jobs.push_back(job);
            jobs.len()
        };
        debug!(queue = self.id.as_str(), size, "Job pushed");
        self.notify.notify_one();
    }

    /// Remove the job at the head. `None` when empty; never blocks.
    pub fn pop(&self) -> Option<T> {
        let mut jobs = self.lock();
        let job = jobs.pop_front();
        if job.is_some() {
            debug!(queue = self.id.as_str(), remaining = jobs.len(), "Job popped");
        }
        job
    }

    /// Pop, or wait up to `idle` for a push and try once more.
    ///
    /// Returns `None` if the queue is still empty after the wait.
    pub async fn pop_wait(&self, idle: Duration) -> Option<T> {
        if let Some(job) = self.pop() {
            return Some(job);
        }
        let _ = tokio::time::timeout(idle, self.notify.notified()).await;
        self.pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Both pipeline queues, shared by the producer and the two workers.
pub struct QueueStore {
    incoming: JobQueue<RawItem>,
    deep_extraction: JobQueue<CompositeJob>,
}

impl QueueStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            incoming: JobQueue::new(QueueId::Incoming),
            deep_extraction: JobQueue::new(QueueId::DeepExtraction),
        })
    }

    /// Queue 1: raw items awaiting triage.
    pub fn incoming(&self) -> &JobQueue<RawItem> {
        &self.incoming
    }

    /// Queue 2: triaged leads awaiting deep extraction.
    pub fn deep_extraction(&self) -> &JobQueue<CompositeJob> {
        &self.deep_extraction
    }
}
