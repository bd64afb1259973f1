//! In-process queue for tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use contactforge_shared::JobId;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job_queue::{
    Delivery, EnqueueRequest, FailOutcome, JobQueue, QueueDepth, RetryTicket,
};
use crate::policy::RetryPolicy;

#[derive(Debug, Clone)]
enum EntryState {
    Pending { visible_at: Instant },
    Leased { receipt: String, expires_at: Instant },
    Done,
    Dead,
}

#[derive(Debug, Clone)]
struct Entry {
    job_id: JobId,
    priority: i64,
    max_attempts: u32,
    attempts: u32,
    seq: u64,
    state: EntryState,
}

impl Entry {
    /// When this entry can be delivered, if it can be at all.
    fn ready_at(&self) -> Option<Instant> {
        match &self.state {
            EntryState::Pending { visible_at } => Some(*visible_at),
            EntryState::Leased { expires_at, .. } if self.attempts < self.max_attempts => {
                Some(*expires_at)
            }
            _ => None,
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            EntryState::Pending { .. } => "pending",
            EntryState::Leased { .. } => "leased",
            EntryState::Done => "done",
            EntryState::Dead => "dead",
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl State {
    /// Look up the leased entry a delivery refers to.
    fn leased_mut(&mut self, delivery: &Delivery) -> Result<&mut Entry, QueueError> {
        let entry = self
            .entries
            .get_mut(&delivery.job_id)
            .ok_or_else(|| QueueError::NotFound(delivery.job_id.clone()))?;
        let current = matches!(
            &entry.state,
            EntryState::Leased { receipt, .. } if *receipt == delivery.receipt
        );
        if current {
            Ok(entry)
        } else {
            Err(QueueError::StaleReceipt(delivery.job_id.clone()))
        }
    }
}

/// [`JobQueue`] held entirely in memory. Contents are lost on exit.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            policy,
            visibility_timeout,
        }
    }

    /// Claim the best ready entry, or report when the next one becomes ready.
    async fn try_claim(&self) -> Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let best = state
            .entries
            .values()
            .filter_map(|e| e.ready_at().map(|at| (e, at)))
            .filter(|(_, at)| *at <= now)
            .min_by_key(|(e, at)| (e.priority, *at, e.seq))
            .map(|(e, _)| e.job_id.clone());

        let Some(job_id) = best else {
            let next = state.entries.values().filter_map(Entry::ready_at).min();
            return Err(next);
        };

        let Some(entry) = state.entries.get_mut(&job_id) else {
            return Err(None);
        };
        entry.attempts += 1;
        let receipt = Uuid::now_v7().to_string();
        entry.state = EntryState::Leased {
            receipt: receipt.clone(),
            expires_at: now + self.visibility_timeout,
        };
        Ok(Delivery {
            job_id,
            receipt,
            attempt: entry.attempts,
            max_attempts: entry.max_attempts,
            priority: entry.priority,
        })
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(&request.job_id) {
            if !matches!(existing.state, EntryState::Done | EntryState::Dead) {
                return Err(QueueError::AlreadyQueued(request.job_id));
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            request.job_id.clone(),
            Entry {
                job_id: request.job_id.clone(),
                priority: request.priority,
                max_attempts: request.max_attempts,
                attempts: 0,
                seq,
                state: EntryState::Pending {
                    visible_at: Instant::now(),
                },
            },
        );
        drop(state);

        self.notify.notify_one();
        tracing::debug!(job_id = %request.job_id, priority = request.priority, "enqueued");
        Ok(request.job_id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_ready = match self.try_claim().await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_ready) => next_ready,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_ready.map_or(deadline, |at| at.min(deadline)).max(now);

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_mut(delivery)?;
        if let EntryState::Leased { expires_at, .. } = &mut entry.state {
            *expires_at = Instant::now() + self.visibility_timeout;
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_mut(delivery)?;
        entry.state = EntryState::Done;
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_mut(delivery)?;

        if entry.attempts < entry.max_attempts {
            let delay = self.policy.delay_for(entry.attempts);
            entry.state = EntryState::Pending {
                visible_at: Instant::now() + delay,
            };
            tracing::debug!(
                job_id = %delivery.job_id,
                attempt = entry.attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "rescheduled"
            );
            Ok(FailOutcome::Retrying {
                attempt: entry.attempts,
                delay,
            })
        } else {
            entry.state = EntryState::Dead;
            Ok(FailOutcome::Exhausted {
                attempts: entry.attempts,
            })
        }
    }

    async fn discard(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_mut(delivery)?;
        entry.state = EntryState::Dead;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.leased_mut(delivery)?;
        entry.attempts = entry.attempts.saturating_sub(1);
        entry.state = EntryState::Pending {
            visible_at: Instant::now(),
        };
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn retry(&self, job_id: &JobId, reset: bool) -> Result<RetryTicket, QueueError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;

        if !matches!(entry.state, EntryState::Done | EntryState::Dead) {
            return Err(QueueError::InvalidState {
                job_id: job_id.clone(),
                state: entry.state_name(),
            });
        }
        if reset {
            entry.attempts = 0;
        } else if entry.attempts >= entry.max_attempts {
            return Err(QueueError::Exhausted {
                job_id: job_id.clone(),
                attempts: entry.attempts,
                max_attempts: entry.max_attempts,
            });
        }
        entry.state = EntryState::Pending {
            visible_at: Instant::now(),
        };
        let ticket = RetryTicket {
            attempt: entry.attempts + 1,
            max_attempts: entry.max_attempts,
        };
        drop(state);

        self.notify.notify_one();
        Ok(ticket)
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(job_id) {
            Some(entry) if matches!(entry.state, EntryState::Pending { .. }) => {
                entry.state = EntryState::Dead;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(QueueError::NotFound(job_id.clone())),
        }
    }

    async fn reap_expired(&self) -> Result<Vec<JobId>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut reaped = Vec::new();
        for entry in state.entries.values_mut() {
            if let EntryState::Leased { expires_at, .. } = entry.state {
                if expires_at <= now && entry.attempts >= entry.max_attempts {
                    entry.state = EntryState::Dead;
                    reaped.push(entry.job_id.clone());
                }
            }
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock().await;
        let mut depth = QueueDepth::default();
        for entry in state.entries.values() {
            match entry.state {
                EntryState::Pending { .. } => depth.pending += 1,
                EntryState::Leased { .. } => depth.leased += 1,
                EntryState::Done => depth.done += 1,
                EntryState::Dead => depth.dead += 1,
            }
        }
        Ok(depth)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(visibility: Duration) -> MemoryQueue {
        MemoryQueue::new(
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
            visibility,
        )
    }

    fn request(priority: i64, max_attempts: u32) -> EnqueueRequest {
        EnqueueRequest {
            job_id: JobId::new(),
            priority,
            max_attempts,
        }
    }

    const WAIT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn lower_priority_number_first() {
        let q = queue(Duration::from_secs(30));
        let low = q.enqueue(request(50, 3)).await.unwrap();
        let high = q.enqueue(request(1, 3)).await.unwrap();

        assert_eq!(q.dequeue(WAIT).await.unwrap().unwrap().job_id, high);
        assert_eq!(q.dequeue(WAIT).await.unwrap().unwrap().job_id, low);
        assert!(q.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let q = queue(Duration::from_secs(30));
        let first = q.enqueue(request(5, 3)).await.unwrap();
        let second = q.enqueue(request(5, 3)).await.unwrap();
        assert_eq!(q.dequeue(WAIT).await.unwrap().unwrap().job_id, first);
        assert_eq!(q.dequeue(WAIT).await.unwrap().unwrap().job_id, second);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let q = queue(Duration::from_secs(30));
        let req = request(1, 3);
        q.enqueue(req.clone()).await.unwrap();
        assert!(matches!(
            q.enqueue(req).await,
            Err(QueueError::AlreadyQueued(_))
        ));
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let q = Arc::new(queue(Duration::from_secs(30)));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = q.enqueue(request(1, 3)).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job_id, id);
        assert_eq!(delivery.attempt, 1);
    }

    #[tokio::test]
    async fn fail_backs_off_then_exhausts() {
        let q = queue(Duration::from_secs(30));
        let id = q.enqueue(request(1, 2)).await.unwrap();

        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        let outcome = q.fail(&first, "adapter down").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(20)
            }
        );

        // Not visible until the backoff elapses.
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());

        let second = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(second.job_id, id);
        assert_eq!(second.attempt, 2);
        assert!(second.is_final_attempt());

        let outcome = q.fail(&second, "adapter down").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 2 });
        assert_eq!(q.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_receipt_goes_stale() {
        let q = queue(Duration::from_millis(30));
        let id = q.enqueue(request(1, 3)).await.unwrap();

        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        let second = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(second.job_id, id);
        assert_eq!(second.attempt, 2);
        assert_ne!(first.receipt, second.receipt);

        assert!(matches!(
            q.ack(&first).await,
            Err(QueueError::StaleReceipt(_))
        ));
        q.ack(&second).await.unwrap();
        assert_eq!(q.depth().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn extended_lease_is_not_redelivered() {
        let q = queue(Duration::from_millis(60));
        q.enqueue(request(1, 3)).await.unwrap();
        let held = q.dequeue(WAIT).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            q.extend(&held).await.unwrap();
        }
        assert!(q.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
        q.ack(&held).await.unwrap();
    }

    #[tokio::test]
    async fn extend_after_redelivery_is_stale() {
        let q = queue(Duration::from_millis(20));
        q.enqueue(request(1, 3)).await.unwrap();
        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        let _second = q.dequeue(WAIT).await.unwrap().unwrap();

        assert!(matches!(
            q.extend(&first).await,
            Err(QueueError::StaleReceipt(_))
        ));
    }

    #[tokio::test]
    async fn no_concurrent_double_delivery() {
        let q = Arc::new(queue(Duration::from_secs(30)));
        for _ in 0..10 {
            q.enqueue(request(1, 3)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(d) = q.dequeue(Duration::from_millis(20)).await.unwrap() {
                    got.push(d.job_id);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 10);
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn reap_collects_expired_final_attempts() {
        let q = queue(Duration::from_millis(10));
        let id = q.enqueue(request(1, 1)).await.unwrap();
        let delivery = q.dequeue(WAIT).await.unwrap().unwrap();
        assert!(delivery.is_final_attempt());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // No attempts left, so the expired lease is not redelivered.
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(q.reap_expired().await.unwrap(), vec![id]);
        assert!(q.reap_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_refunds_the_attempt() {
        let q = queue(Duration::from_secs(30));
        q.enqueue(request(1, 3)).await.unwrap();
        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        q.release(&first).await.unwrap();
        let again = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn retry_requires_terminal_entry_and_attempts() {
        let q = queue(Duration::from_secs(30));
        let id = q.enqueue(request(1, 1)).await.unwrap();
        assert!(matches!(
            q.retry(&id, false).await,
            Err(QueueError::InvalidState { state: "pending", .. })
        ));

        let delivery = q.dequeue(WAIT).await.unwrap().unwrap();
        q.fail(&delivery, "boom").await.unwrap();
        assert!(matches!(
            q.retry(&id, false).await,
            Err(QueueError::Exhausted { .. })
        ));

        let ticket = q.retry(&id, true).await.unwrap();
        assert_eq!(ticket, RetryTicket { attempt: 1, max_attempts: 1 });
        assert_eq!(q.dequeue(WAIT).await.unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn remove_only_touches_pending_entries() {
        let q = queue(Duration::from_secs(30));
        let pending = q.enqueue(request(2, 3)).await.unwrap();
        let leased = q.enqueue(request(1, 3)).await.unwrap();
        let delivery = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, leased);

        assert!(q.remove(&pending).await.unwrap());
        assert!(!q.remove(&leased).await.unwrap());
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());

        // A removed job can be brought back.
        let ticket = q.retry(&pending, false).await.unwrap();
        assert_eq!(ticket.attempt, 1);
    }
}
