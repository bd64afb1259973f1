//! libSQL-backed queue that survives process restarts.
//!
//! One row per job in `queue_entries`. `ready_at` (epoch millis) is the
//! visibility time of a pending entry or the lease expiry of a leased one,
//! so a single ordered scan finds both fresh work and expired leases.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use contactforge_shared::JobId;
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job_queue::{
    Delivery, EnqueueRequest, FailOutcome, JobQueue, QueueDepth, RetryTicket,
};
use crate::policy::RetryPolicy;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    job_id       TEXT PRIMARY KEY,
    priority     INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    state        TEXT NOT NULL,
    ready_at     INTEGER NOT NULL,
    receipt      TEXT,
    seq          INTEGER NOT NULL,
    last_error   TEXT,
    updated_at   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_ready ON queue_entries(state, priority, ready_at);
"#;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// A row as seen by the claim scan.
struct Candidate {
    job_key: String,
    state: String,
    attempts: i64,
    ready_at: i64,
}

/// [`JobQueue`] persisted in a libSQL database.
pub struct LibsqlQueue {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    gate: Mutex<()>,
    policy: RetryPolicy,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl LibsqlQueue {
    /// Open or create the queue database at `path`.
    pub async fn open(
        path: &Path,
        policy: RetryPolicy,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    QueueError::Backend(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        conn.execute_batch(SCHEMA).await?;

        tracing::debug!(path = %path.display(), "opened durable queue");
        Ok(Self {
            db,
            conn,
            gate: Mutex::new(()),
            policy,
            visibility_timeout,
            poll_interval,
        })
    }

    async fn try_claim(&self) -> Result<Option<Delivery>, QueueError> {
        let _gate = self.gate.lock().await;
        loop {
            let now = now_ms();
            let Some(candidate) = self.next_ready(now).await? else {
                return Ok(None);
            };
            // Another process claimed or settled it between the scan and the update.
            if let Some(delivery) = self.claim(&candidate, now).await? {
                return Ok(Some(delivery));
            }
        }
    }

    /// The highest-priority deliverable row at `now`.
    async fn next_ready(&self, now: i64) -> Result<Option<Candidate>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, state, attempts, ready_at FROM queue_entries
                 WHERE ready_at <= ?1
                   AND (state = 'pending' OR (state = 'leased' AND attempts < max_attempts))
                 ORDER BY priority, ready_at, seq
                 LIMIT 1",
                params![now],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(Candidate {
            job_key: row.get(0)?,
            state: row.get(1)?,
            attempts: row.get(2)?,
            ready_at: row.get(3)?,
        }))
    }

    /// Lease `candidate` if the row is still exactly as scanned.
    async fn claim(&self, candidate: &Candidate, now: i64) -> Result<Option<Delivery>, QueueError> {
        let receipt = Uuid::now_v7().to_string();
        let mut claimed = self
            .conn
            .query(
                "UPDATE queue_entries
                 SET state = 'leased', attempts = attempts + 1, receipt = ?1,
                     ready_at = ?2, updated_at = ?3
                 WHERE job_id = ?4 AND state = ?5 AND attempts = ?6 AND ready_at = ?7
                 RETURNING attempts, max_attempts, priority",
                params![
                    receipt.as_str(),
                    now + millis(self.visibility_timeout),
                    now,
                    candidate.job_key.as_str(),
                    candidate.state.as_str(),
                    candidate.attempts,
                    candidate.ready_at,
                ],
            )
            .await?;

        let Some(row) = claimed.next().await? else {
            return Ok(None);
        };
        let job_key = &candidate.job_key;
        let job_id = job_key
            .parse()
            .map_err(|e| QueueError::Backend(format!("invalid job id '{job_key}': {e}")))?;
        Ok(Some(Delivery {
            job_id,
            receipt,
            attempt: row.get::<i64>(0)? as u32,
            max_attempts: row.get::<i64>(1)? as u32,
            priority: row.get(2)?,
        }))
    }

    /// Explain why a receipt-guarded update touched no row.
    async fn receipt_error(&self, job_id: &JobId) -> QueueError {
        let exists = match self
            .conn
            .query(
                "SELECT 1 FROM queue_entries WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
        {
            Ok(mut rows) => matches!(rows.next().await, Ok(Some(_))),
            Err(e) => return e.into(),
        };
        if exists {
            QueueError::StaleReceipt(job_id.clone())
        } else {
            QueueError::NotFound(job_id.clone())
        }
    }

    /// Move a leased entry to `state` if the receipt is still current.
    async fn settle(&self, delivery: &Delivery, state: &str) -> Result<(), QueueError> {
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE queue_entries SET state = ?1, receipt = NULL, updated_at = ?2
                 WHERE job_id = ?3 AND state = 'leased' AND receipt = ?4",
                params![
                    state,
                    now_ms(),
                    delivery.job_id.to_string(),
                    delivery.receipt.as_str()
                ],
            )
            .await?;
        if changed == 0 {
            return Err(self.receipt_error(&delivery.job_id).await);
        }
        Ok(())
    }

    async fn entry_state(&self, job_id: &JobId) -> Result<(String, u32, u32), QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, attempts, max_attempts FROM queue_entries WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        Ok((
            row.get(0)?,
            row.get::<i64>(1)? as u32,
            row.get::<i64>(2)? as u32,
        ))
    }
}

fn state_label(state: &str) -> &'static str {
    match state {
        "pending" => "pending",
        "leased" => "leased",
        "done" => "done",
        _ => "dead",
    }
}

#[async_trait]
impl JobQueue for LibsqlQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let now = now_ms();
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute(
                "INSERT INTO queue_entries (job_id, priority, max_attempts, attempts, state,
                                            ready_at, seq, updated_at)
                 VALUES (?1, ?2, ?3, 0, 'pending', ?4,
                         (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_entries), ?4)
                 ON CONFLICT(job_id) DO UPDATE SET
                   priority = excluded.priority,
                   max_attempts = excluded.max_attempts,
                   attempts = 0,
                   state = 'pending',
                   ready_at = excluded.ready_at,
                   receipt = NULL,
                   seq = excluded.seq,
                   last_error = NULL,
                   updated_at = excluded.updated_at
                 WHERE queue_entries.state IN ('done', 'dead')",
                params![
                    request.job_id.to_string(),
                    request.priority,
                    i64::from(request.max_attempts),
                    now,
                ],
            )
            .await?;
        if changed == 0 {
            return Err(QueueError::AlreadyQueued(request.job_id));
        }
        tracing::debug!(job_id = %request.job_id, priority = request.priority, "enqueued");
        Ok(request.job_id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let now = now_ms();
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE queue_entries SET ready_at = ?1, updated_at = ?2
                 WHERE job_id = ?3 AND state = 'leased' AND receipt = ?4",
                params![
                    now + millis(self.visibility_timeout),
                    now,
                    delivery.job_id.to_string(),
                    delivery.receipt.as_str()
                ],
            )
            .await?;
        if changed == 0 {
            return Err(self.receipt_error(&delivery.job_id).await);
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, "done").await
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT attempts, max_attempts FROM queue_entries
                 WHERE job_id = ?1 AND state = 'leased' AND receipt = ?2",
                params![delivery.job_id.to_string(), delivery.receipt.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(self.receipt_error(&delivery.job_id).await);
        };
        let attempts = row.get::<i64>(0)? as u32;
        let max_attempts = row.get::<i64>(1)? as u32;
        drop(rows);

        let now = now_ms();
        let (outcome, state, ready_at) = if attempts < max_attempts {
            let delay = self.policy.delay_for(attempts);
            (
                FailOutcome::Retrying {
                    attempt: attempts,
                    delay,
                },
                "pending",
                now + millis(delay),
            )
        } else {
            (FailOutcome::Exhausted { attempts }, "dead", now)
        };

        let changed = self
            .conn
            .execute(
                "UPDATE queue_entries
                 SET state = ?1, ready_at = ?2, receipt = NULL, last_error = ?3, updated_at = ?4
                 WHERE job_id = ?5 AND state = 'leased' AND receipt = ?6",
                params![
                    state,
                    ready_at,
                    error,
                    now,
                    delivery.job_id.to_string(),
                    delivery.receipt.as_str(),
                ],
            )
            .await?;
        if changed == 0 {
            return Err(self.receipt_error(&delivery.job_id).await);
        }
        Ok(outcome)
    }

    async fn discard(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, "dead").await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let now = now_ms();
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE queue_entries
                 SET state = 'pending', attempts = MAX(attempts - 1, 0), ready_at = ?1,
                     receipt = NULL, updated_at = ?1
                 WHERE job_id = ?2 AND state = 'leased' AND receipt = ?3",
                params![now, delivery.job_id.to_string(), delivery.receipt.as_str()],
            )
            .await?;
        if changed == 0 {
            return Err(self.receipt_error(&delivery.job_id).await);
        }
        Ok(())
    }

    async fn retry(&self, job_id: &JobId, reset: bool) -> Result<RetryTicket, QueueError> {
        let _gate = self.gate.lock().await;
        let (state, attempts, max_attempts) = self.entry_state(job_id).await?;

        if state != "done" && state != "dead" {
            return Err(QueueError::InvalidState {
                job_id: job_id.clone(),
                state: state_label(&state),
            });
        }
        let attempts = if reset { 0 } else { attempts };
        if attempts >= max_attempts {
            return Err(QueueError::Exhausted {
                job_id: job_id.clone(),
                attempts,
                max_attempts,
            });
        }

        let now = now_ms();
        self.conn
            .execute(
                "UPDATE queue_entries
                 SET state = 'pending', attempts = ?1, ready_at = ?2, receipt = NULL,
                     updated_at = ?2
                 WHERE job_id = ?3",
                params![i64::from(attempts), now, job_id.to_string()],
            )
            .await?;
        Ok(RetryTicket {
            attempt: attempts + 1,
            max_attempts,
        })
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let _gate = self.gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE queue_entries SET state = 'dead', updated_at = ?1
                 WHERE job_id = ?2 AND state = 'pending'",
                params![now_ms(), job_id.to_string()],
            )
            .await?;
        if changed == 0 {
            // Distinguish "not pending" from "unknown".
            self.entry_state(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn reap_expired(&self) -> Result<Vec<JobId>, QueueError> {
        let now = now_ms();
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "UPDATE queue_entries SET state = 'dead', receipt = NULL, updated_at = ?1
                 WHERE state = 'leased' AND ready_at <= ?1 AND attempts >= max_attempts
                 RETURNING job_id",
                params![now],
            )
            .await?;

        let mut reaped = Vec::new();
        while let Some(row) = rows.next().await? {
            let job_key: String = row.get(0)?;
            let job_id: JobId = job_key
                .parse()
                .map_err(|e| QueueError::Backend(format!("invalid job id '{job_key}': {e}")))?;
            reaped.push(job_id);
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, COUNT(*) FROM queue_entries GROUP BY state",
                params![],
            )
            .await?;

        let mut depth = QueueDepth::default();
        while let Some(row) = rows.next().await? {
            let state: String = row.get(0)?;
            let count = row.get::<i64>(1)? as u64;
            match state.as_str() {
                "pending" => depth.pending = count,
                "leased" => depth.leased = count,
                "done" => depth.done = count,
                _ => depth.dead += count,
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

    async fn test_queue(visibility: Duration) -> (LibsqlQueue, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("cf_queue_{}.db", Uuid::now_v7()));
        let queue = LibsqlQueue::open(
            &path,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
            visibility,
            Duration::from_millis(5),
        )
        .await
        .expect("open queue");
        (queue, path)
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
    async fn priority_and_ack() {
        let (q, _) = test_queue(Duration::from_secs(30)).await;
        let low = q.enqueue(request(9, 3)).await.unwrap();
        let high = q.enqueue(request(1, 3)).await.unwrap();

        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(first.job_id, high);
        assert_eq!(first.attempt, 1);
        q.ack(&first).await.unwrap();

        let second = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(second.job_id, low);

        let depth = q.depth().await.unwrap();
        assert_eq!(depth.done, 1);
        assert_eq!(depth.leased, 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let (q, path) = test_queue(Duration::from_secs(30)).await;
        let id = q.enqueue(request(1, 3)).await.unwrap();
        drop(q);

        let reopened = LibsqlQueue::open(
            &path,
            RetryPolicy::default(),
            Duration::from_secs(30),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert_eq!(reopened.dequeue(WAIT).await.unwrap().unwrap().job_id, id);
    }

    #[tokio::test]
    async fn duplicate_live_entry_is_rejected() {
        let (q, _) = test_queue(Duration::from_secs(30)).await;
        let req = request(1, 3);
        q.enqueue(req.clone()).await.unwrap();
        assert!(matches!(
            q.enqueue(req).await,
            Err(QueueError::AlreadyQueued(_))
        ));
    }

    #[tokio::test]
    async fn fail_backs_off_then_exhausts() {
        let (q, _) = test_queue(Duration::from_secs(30)).await;
        let id = q.enqueue(request(1, 2)).await.unwrap();

        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        let outcome = q.fail(&first, "timeout").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());

        let second = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(second.job_id, id);
        assert_eq!(second.attempt, 2);
        assert_eq!(
            q.fail(&second, "timeout").await.unwrap(),
            FailOutcome::Exhausted { attempts: 2 }
        );

        assert!(matches!(
            q.retry(&id, false).await,
            Err(QueueError::Exhausted { .. })
        ));
        let ticket = q.retry(&id, true).await.unwrap();
        assert_eq!(ticket.attempt, 1);
    }

    #[tokio::test]
    async fn stale_receipt_after_redelivery() {
        let (q, _) = test_queue(Duration::from_millis(20)).await;
        q.enqueue(request(1, 3)).await.unwrap();

        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        let second = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);

        assert!(matches!(
            q.fail(&first, "late").await,
            Err(QueueError::StaleReceipt(_))
        ));
        q.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn extend_keeps_the_lease() {
        let (q, _) = test_queue(Duration::from_millis(60)).await;
        q.enqueue(request(1, 3)).await.unwrap();
        let held = q.dequeue(WAIT).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            q.extend(&held).await.unwrap();
        }
        assert!(q.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
        q.ack(&held).await.unwrap();
        assert!(matches!(
            q.extend(&held).await,
            Err(QueueError::StaleReceipt(_))
        ));
    }

    #[tokio::test]
    async fn claim_skips_row_settled_after_scan() {
        let (q, _) = test_queue(Duration::from_secs(30)).await;
        let id = q.enqueue(request(1, 3)).await.unwrap();

        let now = now_ms();
        let scanned = q.next_ready(now).await.unwrap().unwrap();
        assert_eq!(scanned.state, "pending");
        // Cancelled between the scan and the update; ready_at is untouched.
        assert!(q.remove(&id).await.unwrap());

        assert!(q.claim(&scanned, now).await.unwrap().is_none());
        let depth = q.depth().await.unwrap();
        assert_eq!(depth.dead, 1);
        assert_eq!(depth.leased, 0);
    }

    #[tokio::test]
    async fn reap_and_remove() {
        let (q, _) = test_queue(Duration::from_millis(10)).await;
        let expiring = q.enqueue(request(1, 1)).await.unwrap();
        let waiting = q.enqueue(request(5, 1)).await.unwrap();

        let delivery = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, expiring);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(q.reap_expired().await.unwrap(), vec![expiring]);
        assert!(q.remove(&waiting).await.unwrap());
        assert!(!q.remove(&waiting).await.unwrap());
        assert!(matches!(
            q.remove(&JobId::new()).await,
            Err(QueueError::NotFound(_))
        ));
        assert_eq!(q.depth().await.unwrap().dead, 2);
    }

    #[tokio::test]
    async fn release_keeps_attempt_budget() {
        let (q, _) = test_queue(Duration::from_secs(30)).await;
        q.enqueue(request(1, 1)).await.unwrap();
        let first = q.dequeue(WAIT).await.unwrap().unwrap();
        q.release(&first).await.unwrap();
        let again = q.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }
}
