//! libSQL storage layer: Job Record Store and Audit Log.
//!
//! The [`Storage`] struct wraps a libSQL database holding enrichment jobs,
//! canonical contacts, their email candidates and the append-only audit log.
//! Every stage of the pipeline writes here incrementally, so partial results
//! stay queryable even when a job ultimately fails.
//!
//! **Access rules:**
//! - Workers and the trigger interface: read-write via [`Storage::open`]
//! - Status/listing commands: read-only via [`Storage::open_readonly`]
//!
//! All writes are serialized through a single write gate so that multi-statement
//! writes (contact upserts, approvals) run in a transaction no other task can
//! interleave with.

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use contactforge_shared::{
    AuditDetails, AuditEvent, ContactForgeError, EmailCandidate, EnrichedContact, EnrichmentJob,
    JobId, JobStatus, NewJob, OrgDescriptor, PipelineStage, Result,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of [`Storage::mark_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The job is now running under the caller's receipt.
    Claimed,
    /// Another delivery holds a live lease on the job.
    Busy,
    /// Terminal, unknown, or out of attempts.
    Unavailable,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_gate: Mutex<()>,
}

fn db_err(e: libsql::Error) -> ContactForgeError {
    ContactForgeError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ContactForgeError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        Self::init(db, false).await
    }

    /// Open a private in-memory database (tests and single-process runs).
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(db_err)?;

        Self::init(db, false).await
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        Self::init(db, true).await
    }

    async fn init(db: Database, readonly: bool) -> Result<Self> {
        let conn = db.connect().map_err(db_err)?;
        conn.execute("PRAGMA foreign_keys = ON", params![])
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly,
            write_gate: Mutex::new(()),
        };
        if !readonly {
            storage.run_migrations().await?;
        }
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ContactForgeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ContactForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Insert a new job in `queued` state.
    pub async fn insert_job(&self, new_job: &NewJob) -> Result<EnrichmentJob> {
        self.check_writable()?;
        if new_job.org.name.trim().is_empty() {
            return Err(ContactForgeError::validation(
                "organization name must not be empty",
            ));
        }
        if new_job.max_attempts == 0 {
            return Err(ContactForgeError::validation("max_attempts must be at least 1"));
        }

        let job = EnrichmentJob {
            id: JobId::new(),
            org: new_job.org.clone(),
            organization_id: new_job.organization_id.clone(),
            requested_by: new_job.requested_by.clone(),
            status: JobStatus::Queued,
            priority: new_job.priority,
            attempt: 0,
            max_attempts: new_job.max_attempts,
            last_stage: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        };

        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO jobs (id, org_name, website, social_profile_url, region_code,
                                   organization_id, requested_by, status, priority, attempt,
                                   max_attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.org.name.as_str(),
                    job.org.website.as_deref(),
                    job.org.social_profile_url.as_deref(),
                    job.org.region_code.as_deref(),
                    job.organization_id.as_deref(),
                    job.requested_by.as_str(),
                    job.status.as_str(),
                    job.priority,
                    i64::from(job.max_attempts),
                    job.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(job)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<EnrichmentJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, org_name, website, social_profile_url, region_code, organization_id,
                        requested_by, status, priority, attempt, max_attempts, last_stage,
                        cancel_requested, created_at, started_at, completed_at, last_error
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Get a job by ID or fail with [`ContactForgeError::NotFound`].
    pub async fn require_job(&self, id: &JobId) -> Result<EnrichmentJob> {
        self.get_job(id)
            .await?
            .ok_or_else(|| ContactForgeError::NotFound(format!("job {id}")))
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<EnrichmentJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, org_name, website, social_profile_url, region_code, organization_id,
                        requested_by, status, priority, attempt, max_attempts, last_stage,
                        cancel_requested, created_at, started_at, completed_at, last_error
                 FROM jobs WHERE ?1 IS NULL OR status = ?1 ORDER BY id DESC",
                params![status.map(|s| s.as_str())],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Claim a job for the delivery identified by `receipt`, holding it for `lease`.
    ///
    /// A `running` job is only taken over once the previous holder's lease
    /// lapsed, so two workers never run the same job at once. Terminal jobs
    /// are never resurrected by a stale redelivery.
    pub async fn mark_running(
        &self,
        id: &JobId,
        attempt: u32,
        receipt: &str,
        lease: Duration,
    ) -> Result<Claim> {
        self.check_writable()?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = now_ms.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        let _gate = self.write_gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running', attempt = ?1,
                        started_at = COALESCE(started_at, ?2), last_error = NULL,
                        lease_receipt = ?3, lease_expires_at = ?4
                 WHERE id = ?5 AND ?1 <= max_attempts
                   AND (status = 'queued'
                        OR (status = 'running'
                            AND (lease_expires_at IS NULL OR lease_expires_at <= ?6
                                 OR lease_receipt = ?3)))",
                params![
                    i64::from(attempt),
                    now.to_rfc3339(),
                    receipt,
                    expires_at,
                    id.to_string(),
                    now_ms,
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(Claim::Claimed);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM jobs
                 WHERE id = ?1 AND status = 'running' AND ?2 <= max_attempts
                   AND lease_expires_at > ?3",
                params![id.to_string(), i64::from(attempt), now_ms],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(_) => Ok(Claim::Busy),
            None => Ok(Claim::Unavailable),
        }
    }

    /// Renew the lease held by `receipt`. Returns `false` once it is no longer the holder.
    pub async fn extend_lease(&self, id: &JobId, receipt: &str, lease: Duration) -> Result<bool> {
        self.check_writable()?;
        let expires_at = Utc::now()
            .timestamp_millis()
            .saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        let _gate = self.write_gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1
                 WHERE id = ?2 AND status = 'running' AND lease_receipt = ?3",
                params![expires_at, id.to_string(), receipt],
            )
            .await
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Return a running job to `queued` after a retryable failure.
    pub async fn mark_requeued(&self, id: &JobId, error: &str) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "UPDATE jobs SET status = 'queued', last_error = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![error, id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record the last pipeline stage that finished successfully.
    pub async fn set_last_stage(&self, id: &JobId, stage: PipelineStage) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "UPDATE jobs SET last_stage = ?1 WHERE id = ?2",
                params![stage.as_str(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a job to terminal `completed`.
    pub async fn mark_completed(&self, id: &JobId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?1, last_error = NULL,
                        last_stage = 'persisted'
                 WHERE id = ?2 AND status != 'failed'",
                params![now.as_str(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a job to terminal `failed` with a human-readable error.
    pub async fn mark_failed(&self, id: &JobId, error: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "UPDATE jobs SET status = 'failed', completed_at = ?1, last_error = ?2
                 WHERE id = ?3 AND status != 'completed'",
                params![now.as_str(), error, id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Flag a job for cancellation. Returns `false` if the job is already terminal.
    pub async fn request_cancel(&self, id: &JobId) -> Result<bool> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1
                 WHERE id = ?1 AND status IN ('queued', 'running')",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Whether an external actor asked for this job to stop.
    pub async fn is_cancel_requested(&self, id: &JobId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? != 0),
            Ok(None) => Err(ContactForgeError::NotFound(format!("job {id}"))),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Put a terminal job back to `queued` for an explicit retry.
    ///
    /// `attempt` is the attempt bookkeeping the job resumes with (0 when reset).
    /// The stage marker is cleared so the retry runs the whole pipeline.
    pub async fn reset_for_retry(&self, id: &JobId, attempt: u32) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'queued', attempt = ?1, completed_at = NULL,
                        last_error = NULL, last_stage = NULL, cancel_requested = 0
                 WHERE id = ?2 AND status IN ('completed', 'failed')",
                params![i64::from(attempt), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if changed != 1 {
            return Err(ContactForgeError::Conflict(format!(
                "job {id} is not in a terminal state"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Contact operations
    // -----------------------------------------------------------------------

    /// Replace the job's contact set with `contacts`, keyed on `natural_key`.
    ///
    /// Existing rows are updated in place (keeping their id, email candidates and
    /// approval) and never lose confidence; rows that are no longer produced and
    /// were not approved are removed. Re-running with the same input converges
    /// to the same set.
    pub async fn upsert_contacts(
        &self,
        job_id: &JobId,
        contacts: &[EnrichedContact],
    ) -> Result<Vec<EnrichedContact>> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let job_key = job_id.to_string();

        let _gate = self.write_gate.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        for contact in contacts {
            let sources_json = serde_json::to_string(&contact.sources)
                .map_err(|e| ContactForgeError::Storage(e.to_string()))?;
            tx.execute(
                "INSERT INTO contacts (id, job_id, organization_id, natural_key, first_name,
                                       last_name, job_title, organization, profile_url,
                                       confidence, sources_json, lawful_basis,
                                       compliance_checked, notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                 ON CONFLICT(job_id, natural_key) DO UPDATE SET
                   organization_id = excluded.organization_id,
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   job_title = excluded.job_title,
                   organization = excluded.organization,
                   profile_url = excluded.profile_url,
                   confidence = MAX(contacts.confidence, excluded.confidence),
                   sources_json = excluded.sources_json,
                   lawful_basis = excluded.lawful_basis,
                   compliance_checked = excluded.compliance_checked,
                   notes = excluded.notes,
                   updated_at = excluded.updated_at",
                params![
                    Uuid::now_v7().to_string(),
                    job_key.as_str(),
                    contact.organization_id.as_deref(),
                    contact.natural_key.as_str(),
                    contact.first_name.as_str(),
                    contact.last_name.as_str(),
                    contact.job_title.as_deref(),
                    contact.organization.as_deref(),
                    contact.profile_url.as_deref(),
                    i64::from(contact.confidence),
                    sources_json,
                    contact.lawful_basis.as_str(),
                    i64::from(contact.compliance_checked),
                    contact.notes.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        // Drop rows from earlier runs that this run no longer produces.
        let mut stale = Vec::new();
        {
            let mut rows = tx
                .query(
                    "SELECT id, natural_key FROM contacts
                     WHERE job_id = ?1 AND approved_at IS NULL",
                    params![job_key.as_str()],
                )
                .await
                .map_err(db_err)?;
            while let Ok(Some(row)) = rows.next().await {
                let id: String = row.get(0).map_err(db_err)?;
                let key: String = row.get(1).map_err(db_err)?;
                if !contacts.iter().any(|c| c.natural_key == key) {
                    stale.push(id);
                }
            }
        }
        for id in &stale {
            tx.execute("DELETE FROM contacts WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(db_err)?;
        }
        if !stale.is_empty() {
            tracing::debug!(job_id = %job_id, removed = stale.len(), "pruned stale contacts");
        }

        tx.commit().await.map_err(db_err)?;
        drop(_gate);

        self.list_contacts(job_id).await
    }

    /// List a job's contacts ordered by confidence (desc) then name.
    pub async fn list_contacts(&self, job_id: &JobId) -> Result<Vec<EnrichedContact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, organization_id, natural_key, first_name, last_name, job_title,
                        organization, profile_url, confidence, sources_json, lawful_basis,
                        compliance_checked, notes, verified_at, approved_at
                 FROM contacts WHERE job_id = ?1
                 ORDER BY confidence DESC, last_name, first_name, natural_key",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_contact(&row)?);
        }
        Ok(results)
    }

    /// Contacts of a job that have no email candidates yet.
    pub async fn contacts_without_emails(&self, job_id: &JobId) -> Result<Vec<EnrichedContact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.id, c.job_id, c.organization_id, c.natural_key, c.first_name,
                        c.last_name, c.job_title, c.organization, c.profile_url, c.confidence,
                        c.sources_json, c.lawful_basis, c.compliance_checked, c.notes,
                        c.verified_at, c.approved_at
                 FROM contacts c
                 WHERE c.job_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM email_candidates e WHERE e.contact_id = c.id)
                 ORDER BY c.natural_key",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_contact(&row)?);
        }
        Ok(results)
    }

    /// Attach email candidates to a contact. Already-known addresses are skipped.
    ///
    /// Returns the number of newly inserted rows. A contact with at least one
    /// `valid` address gets its `verified_at` stamped.
    pub async fn insert_email_candidates(
        &self,
        contact_id: &str,
        candidates: &[EmailCandidate],
    ) -> Result<usize> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        let mut inserted = 0;
        for candidate in candidates {
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO email_candidates (contact_id, email, status, score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        contact_id,
                        candidate.email.to_lowercase(),
                        candidate.status.as_str(),
                        candidate.score,
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
            inserted += changed as usize;
        }

        if candidates
            .iter()
            .any(|c| c.status == contactforge_shared::VerificationStatus::Valid)
        {
            tx.execute(
                "UPDATE contacts SET verified_at = COALESCE(verified_at, ?1), updated_at = ?1
                 WHERE id = ?2",
                params![now.as_str(), contact_id],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    /// Email candidates of a contact, best score first.
    pub async fn list_email_candidates(&self, contact_id: &str) -> Result<Vec<EmailCandidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT email, status, score FROM email_candidates
                 WHERE contact_id = ?1 ORDER BY score DESC, email",
                params![contact_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(1).map_err(db_err)?;
            results.push(EmailCandidate {
                email: row.get(0).map_err(db_err)?,
                status: status.parse()?,
                score: row.get(2).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    /// Mark contacts of `job_id` approved. Unknown or already-approved ids are skipped.
    ///
    /// Returns the ids that were newly approved.
    pub async fn approve_contacts(
        &self,
        job_id: &JobId,
        contact_ids: &[String],
    ) -> Result<Vec<String>> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let job_key = job_id.to_string();
        let _gate = self.write_gate.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        let mut approved = Vec::new();
        for contact_id in contact_ids {
            let changed = tx
                .execute(
                    "UPDATE contacts SET approved_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND job_id = ?3 AND approved_at IS NULL",
                    params![now.as_str(), contact_id.as_str(), job_key.as_str()],
                )
                .await
                .map_err(db_err)?;
            if changed == 1 {
                approved.push(contact_id.clone());
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(approved)
    }

    /// `(contacts discovered, contacts with at least one email)` for a job.
    pub async fn contact_counts(&self, job_id: &JobId) -> Result<(usize, usize)> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN EXISTS (SELECT 1 FROM email_candidates e
                                                WHERE e.contact_id = c.id) THEN 1 END)
                 FROM contacts c WHERE c.job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let discovered: i64 = row.get(0).map_err(db_err)?;
                let enriched: i64 = row.get(1).map_err(db_err)?;
                Ok((discovered as usize, enriched as usize))
            }
            Ok(None) => Ok((0, 0)),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Total email candidates across a job's contacts.
    pub async fn email_count(&self, job_id: &JobId) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM email_candidates e
                 JOIN contacts c ON c.id = e.contact_id WHERE c.job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    /// Append one audit event. Returns its sequence id.
    pub async fn record_audit(
        &self,
        job_id: &JobId,
        actor_id: &str,
        details: &AuditDetails,
    ) -> Result<i64> {
        self.check_writable()?;
        let metadata = serde_json::to_string(details)
            .map_err(|e| ContactForgeError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO audit_events (job_id, event_type, actor_id, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    job_id.to_string(),
                    details.event_type().as_str(),
                    actor_id,
                    now.as_str(),
                    metadata,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All audit events of a job in append order.
    pub async fn list_audit_events(&self, job_id: &JobId) -> Result<Vec<AuditEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, event_type, actor_id, timestamp, metadata
                 FROM audit_events WHERE job_id = ?1 ORDER BY id",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let job_id: String = row.get(1).map_err(db_err)?;
            let event_type: String = row.get(2).map_err(db_err)?;
            let timestamp: String = row.get(4).map_err(db_err)?;
            results.push(AuditEvent {
                id: row.get(0).map_err(db_err)?,
                job_id: parse_job_id(&job_id)?,
                event_type: event_type.parse()?,
                actor_id: row.get(3).map_err(db_err)?,
                timestamp: parse_time(&timestamp)?,
                metadata: row.get(5).map_err(db_err)?,
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ContactForgeError::Storage(format!("invalid date: {e}")))
}

fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn parse_job_id(s: &str) -> Result<JobId> {
    s.parse()
        .map_err(|e| ContactForgeError::Storage(format!("invalid job id '{s}': {e}")))
}

/// Convert a database row to an [`EnrichmentJob`].
fn row_to_job(row: &libsql::Row) -> Result<EnrichmentJob> {
    let id: String = row.get(0).map_err(db_err)?;
    let status: String = row.get(7).map_err(db_err)?;
    let created_at: String = row.get(13).map_err(db_err)?;
    Ok(EnrichmentJob {
        id: parse_job_id(&id)?,
        org: OrgDescriptor {
            name: row.get(1).map_err(db_err)?,
            website: row.get::<String>(2).ok(),
            social_profile_url: row.get::<String>(3).ok(),
            region_code: row.get::<String>(4).ok(),
        },
        organization_id: row.get::<String>(5).ok(),
        requested_by: row.get(6).map_err(db_err)?,
        status: status.parse()?,
        priority: row.get(8).map_err(db_err)?,
        attempt: row.get::<i64>(9).map_err(db_err)? as u32,
        max_attempts: row.get::<i64>(10).map_err(db_err)? as u32,
        last_stage: row
            .get::<String>(11)
            .ok()
            .map(|s| s.parse())
            .transpose()?,
        cancel_requested: row.get::<i64>(12).map_err(db_err)? != 0,
        created_at: parse_time(&created_at)?,
        started_at: parse_opt_time(row.get::<String>(14).ok())?,
        completed_at: parse_opt_time(row.get::<String>(15).ok())?,
        last_error: row.get::<String>(16).ok(),
    })
}

/// Convert a database row to an [`EnrichedContact`].
fn row_to_contact(row: &libsql::Row) -> Result<EnrichedContact> {
    let job_id: String = row.get(1).map_err(db_err)?;
    let sources_json: String = row.get(10).map_err(db_err)?;
    Ok(EnrichedContact {
        id: row.get(0).map_err(db_err)?,
        job_id: parse_job_id(&job_id)?,
        organization_id: row.get::<String>(2).ok(),
        natural_key: row.get(3).map_err(db_err)?,
        first_name: row.get(4).map_err(db_err)?,
        last_name: row.get(5).map_err(db_err)?,
        job_title: row.get::<String>(6).ok(),
        organization: row.get::<String>(7).ok(),
        profile_url: row.get::<String>(8).ok(),
        confidence: row.get::<i64>(9).map_err(db_err)?.clamp(0, 100) as u8,
        sources: serde_json::from_str(&sources_json)
            .map_err(|e| ContactForgeError::Storage(format!("invalid sources_json: {e}")))?,
        lawful_basis: row.get(11).map_err(db_err)?,
        compliance_checked: row.get::<i64>(12).map_err(db_err)? != 0,
        notes: row.get(13).map_err(db_err)?,
        verified_at: parse_opt_time(row.get::<String>(14).ok())?,
        approved_at: parse_opt_time(row.get::<String>(15).ok())?,
    })
}
