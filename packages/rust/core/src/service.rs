//! Collaborator-facing operations: trigger, status, approval, retry,
//! cancellation and read access to contacts and the audit log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use contactforge_queue::{EnqueueRequest, JobQueue, QueueDepth, QueueError, RetryTicket};
use contactforge_shared::{
    AppConfig, AuditDetails, AuditEvent, ContactForgeError, EmailCandidate, EnrichedContact,
    EnrichmentJob, JobId, JobStatus, JobStatusReport, NewJob, OrgDescriptor, Result,
};
use contactforge_storage::Storage;

/// Input of [`EnrichmentService::submit_enrichment_job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub organization_name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub social_profile_url: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    pub requested_by: String,
    /// Falls back to `queue.default_priority`.
    #[serde(default)]
    pub priority: Option<i64>,
}

/// A contact together with its email candidates.
#[derive(Debug, Clone, Serialize)]
pub struct ContactWithEmails {
    #[serde(flatten)]
    pub contact: EnrichedContact,
    pub emails: Vec<EmailCandidate>,
}

/// How a cancel request took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still waiting and has been taken off the queue.
    Dequeued,
    /// The job is running; it stops at the next stage boundary.
    Flagged,
}

pub struct EnrichmentService {
    store: Arc<Storage>,
    queue: Arc<dyn JobQueue>,
    default_priority: i64,
    max_attempts: u32,
}

impl EnrichmentService {
    pub fn new(store: Arc<Storage>, queue: Arc<dyn JobQueue>, config: &AppConfig) -> Self {
        Self {
            store,
            queue,
            default_priority: config.queue.default_priority,
            max_attempts: config.retry.max_attempts,
        }
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Create a `queued` job and enqueue it.
    #[instrument(skip_all, fields(org = %request.organization_name))]
    pub async fn submit_enrichment_job(&self, request: SubmitRequest) -> Result<JobId> {
        if request.requested_by.trim().is_empty() {
            return Err(ContactForgeError::validation("requesting actor id must not be empty"));
        }

        let job = self
            .store
            .insert_job(&NewJob {
                org: OrgDescriptor {
                    name: request.organization_name.trim().to_string(),
                    website: non_empty(request.website),
                    social_profile_url: non_empty(request.social_profile_url),
                    region_code: non_empty(request.region_code),
                },
                organization_id: non_empty(request.organization_id),
                requested_by: request.requested_by,
                priority: request.priority.unwrap_or(self.default_priority),
                max_attempts: self.max_attempts,
            })
            .await?;

        if let Err(e) = self.queue.enqueue(enqueue_request(&job)).await {
            // Leave no queued record behind that no worker will ever see.
            self.store
                .mark_failed(&job.id, &format!("enqueue failed: {e}"))
                .await?;
            return Err(e.into());
        }

        info!(job_id = %job.id, priority = job.priority, "job submitted");
        Ok(job.id)
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> Result<JobStatusReport> {
        let job = self.store.require_job(job_id).await?;
        let (contacts_discovered, contacts_enriched) = self.store.contact_counts(job_id).await?;
        Ok(JobStatusReport {
            job_id: job.id,
            status: job.status,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            last_stage: job.last_stage,
            contacts_discovered,
            contacts_enriched,
            error_message: job.last_error,
        })
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<EnrichmentJob>> {
        self.store.list_jobs(status).await
    }

    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        Ok(self.queue.depth().await?)
    }

    /// Approve contacts of a job for outreach. Returns how many were newly approved.
    #[instrument(skip_all, fields(job_id = %job_id, actor = actor_id))]
    pub async fn approve_contacts(
        &self,
        job_id: &JobId,
        contact_ids: &[String],
        actor_id: &str,
    ) -> Result<usize> {
        self.store.require_job(job_id).await?;
        let approved = self.store.approve_contacts(job_id, contact_ids).await?;
        if approved.is_empty() {
            return Ok(0);
        }
        let count = approved.len();
        self.store
            .record_audit(
                job_id,
                actor_id,
                &AuditDetails::ContactsApproved {
                    contact_ids: approved,
                },
            )
            .await?;
        info!(approved = count, "contacts approved");
        Ok(count)
    }

    /// Re-run a `completed` or `failed` job.
    ///
    /// Rejected when the job's attempts are used up unless `force` is set,
    /// which starts the attempt count over.
    #[instrument(skip_all, fields(job_id = %job_id, actor = actor_id, force))]
    pub async fn retry_job(&self, job_id: &JobId, actor_id: &str, force: bool) -> Result<RetryTicket> {
        let job = self.store.require_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(ContactForgeError::Conflict(format!(
                "job {job_id} is {} and cannot be retried",
                job.status
            )));
        }
        if !force && job.attempt >= job.max_attempts {
            return Err(ContactForgeError::Conflict(format!(
                "job {job_id} used {}/{} attempts; retry with force to reset",
                job.attempt, job.max_attempts
            )));
        }

        // The record goes back to `queued` before the queue can deliver it.
        let attempt = if force { 0 } else { job.attempt };
        self.store.reset_for_retry(job_id, attempt).await?;

        let ticket = match self.queue.retry(job_id, force).await {
            Ok(ticket) => ticket,
            Err(QueueError::NotFound(_)) => {
                warn!("queue has no entry for job, enqueuing afresh");
                match self.queue.enqueue(enqueue_request(&job)).await {
                    Ok(_) => RetryTicket {
                        attempt: 1,
                        max_attempts: job.max_attempts,
                    },
                    Err(e) => return Err(self.restore_terminal(&job, e).await),
                }
            }
            Err(e) => return Err(self.restore_terminal(&job, e).await),
        };

        self.store
            .record_audit(
                job_id,
                actor_id,
                &AuditDetails::Retried {
                    attempt: ticket.attempt,
                    max_attempts: ticket.max_attempts,
                    forced: force,
                },
            )
            .await?;
        info!(attempt = ticket.attempt, max_attempts = ticket.max_attempts, "job requeued");
        Ok(ticket)
    }

    /// Put the record back into its previous terminal state when the queue
    /// refused the retry.
    async fn restore_terminal(&self, job: &EnrichmentJob, error: QueueError) -> ContactForgeError {
        let restored = if job.status == JobStatus::Completed {
            self.store.mark_completed(&job.id).await
        } else {
            let message = job.last_error.as_deref().unwrap_or("retry rejected by queue");
            self.store.mark_failed(&job.id, message).await
        };
        if let Err(e) = restored {
            warn!(error = %e, "could not restore job state after rejected retry");
        }
        error.into()
    }

    /// Cancel a job that has not finished yet.
    #[instrument(skip_all, fields(job_id = %job_id, actor = actor_id))]
    pub async fn cancel_job(&self, job_id: &JobId, actor_id: &str) -> Result<CancelOutcome> {
        let job = self.store.require_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(ContactForgeError::Conflict(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        let removed = match self.queue.remove(job_id).await {
            Ok(removed) => removed,
            Err(QueueError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        let outcome = if removed {
            self.store.request_cancel(job_id).await?;
            self.store.mark_failed(job_id, "cancelled").await?;
            CancelOutcome::Dequeued
        } else if self.store.request_cancel(job_id).await? {
            CancelOutcome::Flagged
        } else {
            return Err(ContactForgeError::Conflict(format!(
                "job {job_id} finished before it could be cancelled"
            )));
        };

        self.store
            .record_audit(
                job_id,
                actor_id,
                &AuditDetails::Cancelled {
                    was_running: outcome == CancelOutcome::Flagged,
                },
            )
            .await?;
        info!(?outcome, "job cancelled");
        Ok(outcome)
    }

    pub async fn list_contacts(&self, job_id: &JobId) -> Result<Vec<ContactWithEmails>> {
        self.store.require_job(job_id).await?;
        let contacts = self.store.list_contacts(job_id).await?;
        let mut out = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let emails = self.store.list_email_candidates(&contact.id).await?;
            out.push(ContactWithEmails { contact, emails });
        }
        Ok(out)
    }

    pub async fn list_audit_events(&self, job_id: &JobId) -> Result<Vec<AuditEvent>> {
        self.store.require_job(job_id).await?;
        self.store.list_audit_events(job_id).await
    }
}

fn enqueue_request(job: &EnrichmentJob) -> EnqueueRequest {
    EnqueueRequest {
        job_id: job.id.clone(),
        priority: job.priority,
        max_attempts: job.max_attempts,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
