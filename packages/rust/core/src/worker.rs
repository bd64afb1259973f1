//! Bounded worker pool draining the job queue.
//!
//! Each worker owns one job at a time: dequeue, claim the job record, run the
//! pipeline in its own task, then settle the delivery. A failure or panic in
//! one job is converted into a queue `fail` and never reaches the other
//! workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use contactforge_queue::{Delivery, FailOutcome, JobQueue};
use contactforge_shared::{
    AuditDetails, ContactForgeError, EnrichmentJob, JobId, JobStatus, Result, WorkerConfig,
};
use contactforge_storage::{Claim, Storage};

use crate::pipeline::{Orchestrator, PipelineReport};

/// Actor id recorded on audit events the pool writes.
pub const WORKER_ACTOR: &str = "system:worker";

/// Longest pause between retries of a failing queue transport.
const MAX_TRANSPORT_BACKOFF: Duration = Duration::from_secs(5);

/// What a worker runs for each claimed job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &EnrichmentJob) -> Result<PipelineReport>;
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, job: &EnrichmentJob) -> Result<PipelineReport> {
        Orchestrator::run(self, job).await
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    store: Arc<Storage>,
    runner: Arc<dyn JobRunner>,
    config: WorkerConfig,
}

/// Running workers; dropping it without [`PoolHandle::shutdown`] leaves them running.
pub struct PoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Stop dequeuing and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<Storage>,
        runner: Arc<dyn JobRunner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            runner,
            config,
        }
    }

    /// Spawn `pool_size` workers plus the lease reaper.
    pub fn start(&self) -> PoolHandle {
        let (shutdown, rx) = watch::channel(false);
        let size = self.config.pool_size.max(1);
        info!(workers = size, "starting worker pool");

        let mut tasks: Vec<JoinHandle<()>> = (0..size)
            .map(|id| {
                let pool = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move { pool.worker_loop(id, rx).await })
            })
            .collect();

        let pool = self.clone();
        tasks.push(tokio::spawn(async move { pool.reaper_loop(rx).await }));

        PoolHandle { shutdown, tasks }
    }

    /// Run until no job is pending or leased, then shut down.
    pub async fn run_until_drained(&self) -> Result<()> {
        let handle = self.start();
        let poll = self.config.dequeue_timeout().max(Duration::from_millis(20));
        let outcome = loop {
            tokio::time::sleep(poll).await;
            match self.queue.depth().await {
                Ok(depth) if depth.outstanding() == 0 => {
                    debug!(%depth, "queue drained");
                    break Ok(());
                }
                Ok(depth) => debug!(%depth, "waiting for queue to drain"),
                Err(e) => break Err(ContactForgeError::from(e)),
            }
        };
        handle.shutdown().await;
        outcome
    }

    async fn worker_loop(self, id: usize, shutdown: watch::Receiver<bool>) {
        let timeout = self.config.dequeue_timeout();
        let mut backoff = Duration::from_millis(100);

        while !*shutdown.borrow() {
            match self.queue.dequeue(timeout).await {
                Ok(Some(delivery)) => {
                    backoff = Duration::from_millis(100);
                    self.process(id, delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = id, error = %e, delay_ms = backoff.as_millis() as u64, "queue unavailable, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_TRANSPORT_BACKOFF);
                }
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Fail jobs whose lease expired on their final attempt.
    async fn reaper_loop(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.dequeue_timeout().max(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            match self.queue.reap_expired().await {
                Ok(expired) => {
                    for job_id in expired {
                        let message = "visibility timeout expired on final attempt";
                        warn!(%job_id, "{message}");
                        if let Err(e) = self.finish_failed(&job_id, message, None, "lease_expired").await {
                            error!(%job_id, error = %e, "failed to record expired job");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "reaping expired leases failed"),
            }
        }
    }

    /// Handle one delivery end to end. Never returns an error: every outcome
    /// is settled against the queue and the job record.
    #[instrument(skip_all, fields(worker = worker, job_id = %delivery.job_id, attempt = delivery.attempt))]
    async fn process(&self, worker: usize, delivery: Delivery) {
        if let Err(e) = self.try_process(&delivery).await {
            // Storage trouble before or after the run; let the queue retry.
            warn!(error = %e, "could not settle job, handing back to queue");
            self.fail_delivery(&delivery, &e.to_string()).await;
        }
    }

    async fn try_process(&self, delivery: &Delivery) -> Result<()> {
        let Some(job) = self.store.get_job(&delivery.job_id).await? else {
            warn!("job record missing, discarding delivery");
            self.settle(self.queue.discard(delivery).await);
            return Ok(());
        };

        if job.cancel_requested {
            info!("job was cancelled before it started");
            self.store.mark_failed(&job.id, "cancelled").await?;
            self.settle(self.queue.discard(delivery).await);
            return Ok(());
        }

        let lease = self.queue.visibility_timeout();
        match self
            .store
            .mark_running(&job.id, delivery.attempt, &delivery.receipt, lease)
            .await?
        {
            Claim::Claimed => {}
            Claim::Busy => {
                // The current holder settles the job; hand this copy back later.
                warn!("job is running under another lease, deferring delivery");
                tokio::time::sleep(renew_interval(lease)).await;
                self.settle(self.queue.release(delivery).await);
                return Ok(());
            }
            Claim::Unavailable => {
                // Finished elsewhere or out of attempts; this copy is a leftover.
                debug!(status = %job.status, "job not claimable, dropping delivery");
                if job.status == JobStatus::Completed {
                    self.settle(self.queue.ack(delivery).await);
                } else {
                    self.settle(self.queue.discard(delivery).await);
                }
                return Ok(());
            }
        }

        let job = EnrichmentJob {
            status: JobStatus::Running,
            attempt: delivery.attempt,
            ..job
        };
        let runner = Arc::clone(&self.runner);
        let task_job = job.clone();
        let mut run = tokio::spawn(async move { runner.run(&task_job).await });
        let mut renew = tokio::time::interval(renew_interval(lease));
        renew.tick().await;
        let outcome = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = renew.tick() => self.renew_lease(delivery, lease).await,
            }
        };

        match outcome {
            Ok(Ok(report)) => {
                info!(contacts = report.contacts, emails = report.emails, "job finished");
                self.settle(self.queue.ack(delivery).await);
            }
            Ok(Err(ContactForgeError::Cancelled { .. })) => {
                info!("job cancelled at stage boundary");
                self.store.mark_failed(&job.id, "cancelled").await?;
                self.settle(self.queue.discard(delivery).await);
            }
            Ok(Err(e)) if !e.is_retryable() => {
                error!(error = %e, "job failed permanently");
                self.settle(self.queue.discard(delivery).await);
                self.finish_failed(&job.id, &e.to_string(), Some(delivery.attempt), "non_retryable")
                    .await?;
            }
            Ok(Err(e)) => self.fail_delivery(delivery, &e.to_string()).await,
            Err(join_error) => {
                error!(error = %join_error, "job task panicked");
                self.fail_delivery(delivery, &format!("job task panicked: {join_error}"))
                    .await;
            }
        }
        Ok(())
    }

    /// Keep the queue entry and the job record leased while the run is in flight.
    async fn renew_lease(&self, delivery: &Delivery, lease: Duration) {
        if let Err(e) = self.queue.extend(delivery).await {
            warn!(error = %e, "could not extend queue lease");
        }
        match self
            .store
            .extend_lease(&delivery.job_id, &delivery.receipt, lease)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("job lease was taken over"),
            Err(e) => warn!(error = %e, "could not extend job lease"),
        }
    }

    /// Report a retryable failure to the queue and mirror the outcome in the store.
    async fn fail_delivery(&self, delivery: &Delivery, message: &str) {
        let result = match self.queue.fail(delivery, message).await {
            Ok(FailOutcome::Retrying { attempt, delay }) => {
                warn!(
                    error = message,
                    attempt,
                    max_attempts = delivery.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, retrying with backoff"
                );
                self.store.mark_requeued(&delivery.job_id, message).await
            }
            Ok(FailOutcome::Exhausted { attempts }) => {
                error!(error = message, attempts, "job failed, attempts exhausted");
                self.finish_failed(&delivery.job_id, message, Some(attempts), "retries_exhausted")
                    .await
            }
            Err(e) => {
                // The lease was lost; whoever holds the job now settles it.
                warn!(error = %e, "could not report failure to queue");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(error = %e, "could not record job failure");
        }
    }

    /// Move the job to terminal `failed` and write the single `failed` audit event.
    async fn finish_failed(
        &self,
        job_id: &JobId,
        message: &str,
        attempts: Option<u32>,
        reason: &str,
    ) -> Result<()> {
        let attempts = match attempts {
            Some(a) => a,
            None => self.store.require_job(job_id).await?.attempt,
        };
        self.store.mark_failed(job_id, message).await?;
        self.store
            .record_audit(
                job_id,
                WORKER_ACTOR,
                &AuditDetails::Failed {
                    error: message.to_string(),
                    attempts,
                    terminal_reason: reason.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    fn settle(&self, result: std::result::Result<(), contactforge_queue::QueueError>) {
        if let Err(e) = result {
            warn!(error = %e, "queue rejected settlement");
        }
    }
}

/// Renew three times per lease so one late tick never lets it lapse.
fn renew_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use contactforge_discovery::SourceRegistry;
    use contactforge_queue::{EnqueueRequest, MemoryQueue, RetryPolicy};
    use contactforge_shared::{AuditEventType, PipelineConfig};

    use crate::pipeline::tests::{FixedAdapter, StubEnricher, acme_job, person};

    fn worker_config(pool_size: usize) -> WorkerConfig {
        WorkerConfig {
            pool_size,
            dequeue_timeout_ms: 20,
        }
    }

    fn fast_queue() -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new(
            RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            Duration::from_secs(30),
        ))
    }

    async fn submit(store: &Storage, queue: &dyn JobQueue, region: Option<&str>) -> EnrichmentJob {
        let job = store.insert_job(&acme_job(region)).await.unwrap();
        queue
            .enqueue(EnqueueRequest {
                job_id: job.id.clone(),
                priority: job.priority,
                max_attempts: job.max_attempts,
            })
            .await
            .unwrap();
        job
    }

    /// Runner that always fails with a retryable error.
    struct AlwaysFails {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for AlwaysFails {
        async fn run(&self, _job: &EnrichmentJob) -> Result<PipelineReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ContactForgeError::Storage("disk full".into()))
        }
    }

    /// Runner that records which jobs are in flight and flags overlap.
    struct Tracking {
        in_flight: Mutex<HashSet<JobId>>,
        overlap: AtomicBool,
        runs: AtomicUsize,
        delay: Duration,
    }

    impl Tracking {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: Mutex::new(HashSet::new()),
                overlap: AtomicBool::new(false),
                runs: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl JobRunner for Tracking {
        async fn run(&self, job: &EnrichmentJob) -> Result<PipelineReport> {
            if !self.in_flight.lock().unwrap().insert(job.id.clone()) {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            self.in_flight.lock().unwrap().remove(&job.id);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(PipelineReport {
                job_id: job.id.clone(),
                contacts: 0,
                emails: 0,
                failed_sources: vec![],
                enrichment_skipped: 0,
                resumed: false,
                elapsed: Duration::ZERO,
            })
        }
    }

    /// Runner that panics.
    struct Panics;

    #[async_trait]
    impl JobRunner for Panics {
        async fn run(&self, _job: &EnrichmentJob) -> Result<PipelineReport> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn always_failing_job_is_attempted_max_attempts_times() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = fast_queue();
        let job = submit(&store, queue.as_ref(), None).await;
        let runner = Arc::new(AlwaysFails {
            calls: AtomicUsize::new(0),
        });

        let pool = WorkerPool::new(queue.clone(), store.clone(), runner.clone(), worker_config(2));
        pool.run_until_drained().await.unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        let stored = store.require_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt, 3);
        assert!(stored.last_error.unwrap().contains("disk full"));

        let failed: Vec<_> = store
            .list_audit_events(&job.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::Failed)
            .collect();
        assert_eq!(failed.len(), 1);

        // Never picked up again.
        pool.run_until_drained().await.unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_job_runs_on_two_workers_at_once() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = fast_queue();
        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(submit(&store, queue.as_ref(), None).await.id);
        }
        let runner = Arc::new(Tracking::new(Duration::from_millis(10)));

        WorkerPool::new(queue.clone(), store.clone(), runner.clone(), worker_config(4))
            .run_until_drained()
            .await
            .unwrap();

        assert!(!runner.overlap.load(Ordering::SeqCst));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 12);
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.done, 12);
    }

    #[tokio::test]
    async fn job_outliving_visibility_timeout_runs_once() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = Arc::new(MemoryQueue::new(
            RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            Duration::from_millis(90),
        ));
        let job = submit(&store, queue.as_ref(), None).await;
        let runner = Arc::new(Tracking::new(Duration::from_millis(300)));

        WorkerPool::new(queue.clone(), store.clone(), runner.clone(), worker_config(3))
            .run_until_drained()
            .await
            .unwrap();

        assert!(!runner.overlap.load(Ordering::SeqCst));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.done, 1);
        assert_eq!(depth.dead, 0);

        let stored = store.require_job(&job.id).await.unwrap();
        assert_ne!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt, 1);
        assert!(
            store
                .list_audit_events(&job.id)
                .await
                .unwrap()
                .iter()
                .all(|e| e.event_type != AuditEventType::Failed)
        );
    }

    #[tokio::test]
    async fn restricted_region_fails_in_one_cycle_with_one_event() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = fast_queue();
        let job = submit(&store, queue.as_ref(), Some("XX")).await;

        let adapter = Arc::new(FixedAdapter::new("A", vec![person("Jane", "Doe", "CMO", 90, "A")]));
        let orchestrator = Orchestrator::new(
            store.clone(),
            SourceRegistry::new().with(adapter.clone()),
            Arc::new(StubEnricher { fail: false }),
            PipelineConfig {
                restricted_regions: vec!["XX".into()],
                ..PipelineConfig::default()
            },
        );

        WorkerPool::new(queue.clone(), store.clone(), Arc::new(orchestrator), worker_config(1))
            .run_until_drained()
            .await
            .unwrap();

        let stored = store.require_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);

        let events = store.list_audit_events(&job.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::Failed);
        assert_eq!(queue.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn panicking_job_does_not_take_down_the_pool() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = fast_queue();
        let job = submit(&store, queue.as_ref(), None).await;

        WorkerPool::new(queue.clone(), store.clone(), Arc::new(Panics), worker_config(1))
            .run_until_drained()
            .await
            .unwrap();

        let stored = store.require_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn cancelled_before_start_is_never_run() {
        let store = Arc::new(Storage::open_in_memory().await.unwrap());
        let queue = fast_queue();
        let job = submit(&store, queue.as_ref(), None).await;
        store.request_cancel(&job.id).await.unwrap();
        let runner = Arc::new(AlwaysFails {
            calls: AtomicUsize::new(0),
        });

        WorkerPool::new(queue.clone(), store.clone(), runner.clone(), worker_config(1))
            .run_until_drained()
            .await
            .unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let stored = store.require_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("cancelled"));
    }
}
