//! Job queue trait and types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use contactforge_shared::JobId;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// What a producer hands to [`JobQueue::enqueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub job_id: JobId,
    /// Lower numbers are delivered first.
    pub priority: i64,
    pub max_attempts: u32,
}

/// One delivery of a job to a worker.
///
/// The receipt identifies this particular delivery; once the visibility timeout
/// lapses and the job is handed to someone else, the old receipt is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub job_id: JobId,
    pub receipt: String,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i64,
}

impl Delivery {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; visible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left; the entry is parked as dead.
    Exhausted { attempts: u32 },
}

/// Result of [`JobQueue::retry`]: the attempt the next delivery will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTicket {
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Entry counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub leased: u64,
    pub done: u64,
    pub dead: u64,
}

impl QueueDepth {
    /// Entries that still need a worker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.leased
    }
}

impl fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} leased={} done={} dead={}",
            self.pending, self.leased, self.done, self.dead
        )
    }
}

/// Durable, at-least-once job queue with priority, delayed retry and
/// max-attempt enforcement.
///
/// Every job has at most one entry. Entries move between `pending`, `leased`,
/// `done` and `dead`; only `pending` entries (and `leased` entries whose
/// visibility timeout lapsed with attempts left) are deliverable.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Fails if the job already has a live entry.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError>;

    /// Wait up to `timeout` for the highest-priority ready job.
    ///
    /// Counts an attempt and hides the job for the visibility timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Push the lease of a delivery out by another visibility timeout.
    ///
    /// Fails with [`QueueError::StaleReceipt`] once the lease was lost.
    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge successful processing.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Report a retryable failure; reschedules with backoff or parks the job as dead.
    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError>;

    /// Park the job as dead without consuming further attempts.
    async fn discard(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand the delivery back untouched; the attempt it consumed is refunded.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Make a `done` or `dead` job deliverable again.
    ///
    /// Rejected with [`QueueError::Exhausted`] when no attempts are left, unless
    /// `reset` is set, which starts the attempt count over.
    async fn retry(&self, job_id: &JobId, reset: bool) -> Result<RetryTicket, QueueError>;

    /// Take a pending job out of circulation. Returns `false` if it is not pending.
    ///
    /// The entry stays parked as dead so it can be retried later.
    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError>;

    /// Park leases that expired on their final attempt and return their job ids.
    async fn reap_expired(&self) -> Result<Vec<JobId>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// How long a delivery stays hidden before it is handed out again.
    fn visibility_timeout(&self) -> Duration;
}
