//! Per-job pipeline: compliance → discovery → deduplication → enrichment → persisted.
//!
//! The [`Orchestrator`] holds no per-job state between runs. Everything it
//! needs to resume a redelivered job lives in the job record, and every stage
//! writes its results before the next one starts, so partial results stay
//! queryable when a later stage fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use contactforge_discovery::SourceRegistry;
use contactforge_shared::{
    AuditDetails, CandidateContact, ContactForgeError, EnrichmentJob, JobId, OrgDescriptor,
    PipelineConfig, PipelineStage, Result,
};
use contactforge_storage::Storage;

use crate::dedup::Deduplicator;
use crate::enrichment::EmailEnricher;

/// Actor id recorded on audit events the pipeline writes itself.
pub const PIPELINE_ACTOR: &str = "system:pipeline";

/// Outcome of one successful pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub job_id: JobId,
    /// Canonical contacts persisted for the job.
    pub contacts: usize,
    /// Email candidates persisted for the job.
    pub emails: usize,
    /// Adapters that failed or timed out during discovery.
    pub failed_sources: Vec<String>,
    /// Contacts that ended the run without email candidates.
    pub enrichment_skipped: usize,
    /// Discovery was skipped because contacts were already persisted.
    pub resumed: bool,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a job enters a stage.
    fn stage(&self, job_id: &JobId, stage: PipelineStage);
    /// Called when a job reaches `persisted`.
    fn done(&self, report: &PipelineReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _job_id: &JobId, _stage: PipelineStage) {}
    fn done(&self, _report: &PipelineReport) {}
}

/// The pipeline state machine. Built once and shared by every worker.
pub struct Orchestrator {
    store: Arc<Storage>,
    sources: SourceRegistry,
    enricher: Arc<dyn EmailEnricher>,
    dedup: Deduplicator,
    config: PipelineConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Storage>,
        sources: SourceRegistry,
        enricher: Arc<dyn EmailEnricher>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            sources,
            enricher,
            dedup: Deduplicator::from_config(&config),
            config,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    /// Drive `job` through every stage up to `persisted`.
    ///
    /// Adapter and enrichment failures degrade locally. Storage errors
    /// propagate and are retryable; a restricted region yields
    /// [`ContactForgeError::Compliance`] before any external call, and a
    /// cancel request yields [`ContactForgeError::Cancelled`] at the next
    /// stage boundary.
    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempt))]
    pub async fn run(&self, job: &EnrichmentJob) -> Result<PipelineReport> {
        let start = Instant::now();
        let resumed = matches!(job.last_stage, Some(s) if s >= PipelineStage::Deduplication);

        let mut candidates: Vec<CandidateContact> = Vec::new();
        let mut failed_sources: Vec<String> = Vec::new();
        let mut enrichment_skipped = 0;
        let mut stage = PipelineStage::ComplianceCheck;

        loop {
            self.progress.stage(&job.id, stage);
            debug!(%stage, "entering stage");

            stage = match stage {
                PipelineStage::ComplianceCheck => {
                    self.check_compliance(job)?;
                    self.store
                        .record_audit(
                            &job.id,
                            PIPELINE_ACTOR,
                            &AuditDetails::Started {
                                attempt: job.attempt,
                                sources: self.sources.names(),
                            },
                        )
                        .await?;
                    if resumed {
                        info!(last_stage = ?job.last_stage, "contacts already persisted, resuming at enrichment");
                        PipelineStage::Enrichment
                    } else {
                        PipelineStage::Discovery
                    }
                }
                PipelineStage::Discovery => {
                    self.ensure_not_cancelled(&job.id).await?;
                    let (found, failed) = self.discover(&job.org).await;
                    self.store
                        .record_audit(
                            &job.id,
                            PIPELINE_ACTOR,
                            &AuditDetails::DiscoveryCompleted {
                                candidates: found.len(),
                                failed_sources: failed.clone(),
                            },
                        )
                        .await?;
                    self.store.set_last_stage(&job.id, PipelineStage::Discovery).await?;
                    candidates = found;
                    failed_sources = failed;
                    PipelineStage::Deduplication
                }
                PipelineStage::Deduplication => {
                    self.ensure_not_cancelled(&job.id).await?;
                    let merged =
                        self.dedup
                            .merge(&job.id, job.organization_id.as_deref(), &candidates);
                    let persisted = self.store.upsert_contacts(&job.id, &merged).await?;
                    self.store
                        .set_last_stage(&job.id, PipelineStage::Deduplication)
                        .await?;
                    info!(
                        candidates = candidates.len(),
                        contacts = persisted.len(),
                        "contacts merged"
                    );
                    PipelineStage::Enrichment
                }
                PipelineStage::Enrichment => {
                    self.ensure_not_cancelled(&job.id).await?;
                    enrichment_skipped = self.enrich(job).await?;
                    self.store.set_last_stage(&job.id, PipelineStage::Enrichment).await?;
                    PipelineStage::Persisted
                }
                PipelineStage::Persisted => {
                    self.ensure_not_cancelled(&job.id).await?;
                    self.store.mark_completed(&job.id).await?;
                    let (contacts, _) = self.store.contact_counts(&job.id).await?;
                    let emails = self.store.email_count(&job.id).await?;
                    self.store
                        .record_audit(
                            &job.id,
                            PIPELINE_ACTOR,
                            &AuditDetails::Completed { contacts, emails },
                        )
                        .await?;

                    let report = PipelineReport {
                        job_id: job.id.clone(),
                        contacts,
                        emails,
                        failed_sources,
                        enrichment_skipped,
                        resumed,
                        elapsed: start.elapsed(),
                    };
                    info!(
                        contacts,
                        emails,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "job completed"
                    );
                    self.progress.done(&report);
                    return Ok(report);
                }
                PipelineStage::Failed => {
                    return Err(ContactForgeError::Conflict(format!(
                        "job {} is already failed",
                        job.id
                    )));
                }
            };
        }
    }

    fn check_compliance(&self, job: &EnrichmentJob) -> Result<()> {
        match job.org.region_code.as_deref() {
            Some(region) if self.config.is_region_restricted(region) => {
                warn!(region, "region is restricted, refusing job");
                Err(ContactForgeError::Compliance {
                    region: region.trim().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn ensure_not_cancelled(&self, job_id: &JobId) -> Result<()> {
        if self.store.is_cancel_requested(job_id).await? {
            info!("cancel requested, stopping at stage boundary");
            return Err(ContactForgeError::Cancelled {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Fan out to every adapter and join. Returns the concatenated candidates
    /// and the names of adapters that failed or timed out.
    #[instrument(skip_all, fields(org = %org.name, sources = self.sources.len()))]
    async fn discover(&self, org: &OrgDescriptor) -> (Vec<CandidateContact>, Vec<String>) {
        let timeout = self.config.adapter_timeout();
        let calls = self.sources.adapters().iter().map(|adapter| async move {
            let outcome = tokio::time::timeout(timeout, adapter.discover(org)).await;
            (adapter.name().to_string(), outcome)
        });

        let mut candidates = Vec::new();
        let mut failed = Vec::new();
        for (source, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(found)) => {
                    debug!(%source, count = found.len(), "adapter returned candidates");
                    candidates.extend(found.into_iter().map(|mut c| {
                        if c.source.is_empty() {
                            c.source = source.clone();
                        }
                        c
                    }));
                }
                Ok(Err(e)) => {
                    warn!(%source, error = %e, "adapter failed, continuing without it");
                    failed.push(source);
                }
                Err(_) => {
                    warn!(%source, timeout_ms = timeout.as_millis() as u64, "adapter timed out, continuing without it");
                    failed.push(source);
                }
            }
        }
        failed.sort();
        (candidates, failed)
    }

    /// Attach email candidates to every contact that has none yet.
    /// Returns how many contacts are still without candidates.
    async fn enrich(&self, job: &EnrichmentJob) -> Result<usize> {
        let pending = self.store.contacts_without_emails(&job.id).await?;
        let mut contacts_enriched = 0;
        let mut emails_found = 0;
        let mut skipped = 0;

        match job.org.email_domain() {
            None => {
                info!(contacts = pending.len(), "no website domain, skipping enrichment");
                skipped = pending.len();
            }
            Some(domain) => {
                let timeout = self.config.enrich_timeout();
                for contact in &pending {
                    let found = match tokio::time::timeout(
                        timeout,
                        self.enricher.enrich(contact, &domain),
                    )
                    .await
                    {
                        Ok(Ok(found)) => found,
                        Ok(Err(e)) => {
                            warn!(contact_id = %contact.id, error = %e, "enrichment failed for contact");
                            Vec::new()
                        }
                        Err(_) => {
                            warn!(contact_id = %contact.id, "enrichment timed out for contact");
                            Vec::new()
                        }
                    };

                    if found.is_empty() {
                        skipped += 1;
                        continue;
                    }
                    emails_found += self.store.insert_email_candidates(&contact.id, &found).await?;
                    contacts_enriched += 1;
                }
            }
        }

        self.store
            .record_audit(
                &job.id,
                PIPELINE_ACTOR,
                &AuditDetails::EnrichmentCompleted {
                    contacts_enriched,
                    emails_found,
                    skipped,
                },
            )
            .await?;
        info!(contacts_enriched, emails_found, skipped, "enrichment finished");
        Ok(skipped)
    }
}
