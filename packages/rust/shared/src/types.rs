//! Core domain types for contact discovery and enrichment jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContactForgeError;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for enrichment job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

/// Implements `as_str`, `Display` and `FromStr` for a unit enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable text form used in storage and on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ContactForgeError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ContactForgeError::parse(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle status of an [`EnrichmentJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    /// Terminal statuses only leave via an explicit, audited retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// States of the per-job pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ComplianceCheck,
    Discovery,
    Deduplication,
    Enrichment,
    Persisted,
    Failed,
}

text_enum!(PipelineStage {
    ComplianceCheck => "compliance_check",
    Discovery => "discovery",
    Deduplication => "deduplication",
    Enrichment => "enrichment",
    Persisted => "persisted",
    Failed => "failed",
});

impl PipelineStage {
    /// The stage that follows a successful run of `self`.
    pub fn next(&self) -> Self {
        match self {
            Self::ComplianceCheck => Self::Discovery,
            Self::Discovery => Self::Deduplication,
            Self::Deduplication => Self::Enrichment,
            Self::Enrichment => Self::Persisted,
            Self::Persisted => Self::Persisted,
            Self::Failed => Self::Failed,
        }
    }
}

/// Verification outcome of a single email address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Valid,
    Risky,
    Invalid,
}

text_enum!(VerificationStatus {
    Unverified => "unverified",
    Valid => "valid",
    Risky => "risky",
    Invalid => "invalid",
});

/// Kind of an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Started,
    DiscoveryCompleted,
    EnrichmentCompleted,
    Completed,
    Failed,
    Retried,
    Cancelled,
    ContactApproved,
}

text_enum!(AuditEventType {
    Started => "started",
    DiscoveryCompleted => "discovery_completed",
    EnrichmentCompleted => "enrichment_completed",
    Completed => "completed",
    Failed => "failed",
    Retried => "retried",
    Cancelled => "cancelled",
    ContactApproved => "contact_approved",
});

// ---------------------------------------------------------------------------
// EnrichmentJob
// ---------------------------------------------------------------------------

/// The organization a job discovers contacts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgDescriptor {
    /// Organization display name.
    pub name: String,
    /// Company website, e.g. `https://acme.example`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Company social profile URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_profile_url: Option<String>,
    /// ISO-3166 style region code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
}

impl OrgDescriptor {
    /// Email domain derived from the website host, without a leading `www.`.
    pub fn email_domain(&self) -> Option<String> {
        let website = self.website.as_deref()?.trim();
        if website.is_empty() {
            return None;
        }
        let parsed = url::Url::parse(website)
            .or_else(|_| url::Url::parse(&format!("https://{website}")))
            .ok()?;
        let host = parsed.host_str()?.to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        if host.contains('.') {
            Some(host.to_string())
        } else {
            None
        }
    }
}

/// A unit of enrichment work, as held by the Job Record Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: JobId,
    pub org: OrgDescriptor,
    /// Optional id of the target organization record in the host application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub requested_by: String,
    pub status: JobStatus,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Last pipeline stage that finished successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stage: Option<PipelineStage>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Input of the trigger interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub org: OrgDescriptor,
    #[serde(default)]
    pub organization_id: Option<String>,
    pub requested_by: String,
    /// Lower numbers are dequeued first.
    pub priority: i64,
    pub max_attempts: u32,
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// An unverified person record reported by a single source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateContact {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// 0–100.
    pub confidence: u8,
    /// Name of the adapter that produced this record.
    pub source: String,
    /// Free-text provenance, e.g. `"team page /about"`.
    pub discovery_method: String,
}

/// A canonical, persisted contact produced by the deduplication stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedContact {
    pub id: String,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Deterministic identity within a job (hash of the canonical key).
    pub natural_key: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// Maximum of all contributing source scores.
    pub confidence: u8,
    /// Contributing adapter names, sorted.
    pub sources: Vec<String>,
    pub lawful_basis: String,
    pub compliance_checked: bool,
    /// Activity trail.
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

impl EnrichedContact {
    /// `"First Last"`, trimmed.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A plausible or verified email address attached to an [`EnrichedContact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailCandidate {
    pub email: String,
    pub status: VerificationStatus,
    /// 0.0–1.0.
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Typed audit metadata; serialized as JSON text in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditDetails {
    Started {
        attempt: u32,
        sources: Vec<String>,
    },
    DiscoveryCompleted {
        candidates: usize,
        failed_sources: Vec<String>,
    },
    EnrichmentCompleted {
        contacts_enriched: usize,
        emails_found: usize,
        skipped: usize,
    },
    Completed {
        contacts: usize,
        emails: usize,
    },
    Failed {
        error: String,
        attempts: u32,
        terminal_reason: String,
    },
    Retried {
        attempt: u32,
        max_attempts: u32,
        forced: bool,
    },
    Cancelled {
        was_running: bool,
    },
    ContactsApproved {
        contact_ids: Vec<String>,
    },
}

impl AuditDetails {
    /// The event type this metadata belongs to.
    pub fn event_type(&self) -> AuditEventType {
        match self {
            Self::Started { .. } => AuditEventType::Started,
            Self::DiscoveryCompleted { .. } => AuditEventType::DiscoveryCompleted,
            Self::EnrichmentCompleted { .. } => AuditEventType::EnrichmentCompleted,
            Self::Completed { .. } => AuditEventType::Completed,
            Self::Failed { .. } => AuditEventType::Failed,
            Self::Retried { .. } => AuditEventType::Retried,
            Self::Cancelled { .. } => AuditEventType::Cancelled,
            Self::ContactsApproved { .. } => AuditEventType::ContactApproved,
        }
    }
}

/// One append-only entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub job_id: JobId,
    pub event_type: AuditEventType,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: String,
}

// ---------------------------------------------------------------------------
// Status interface
// ---------------------------------------------------------------------------

/// Answer of the status interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stage: Option<PipelineStage>,
    pub contacts_discovered: usize,
    pub contacts_enriched: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_text_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn stage_order_follows_pipeline() {
        let mut stage = PipelineStage::ComplianceCheck;
        let mut seen = vec![stage];
        while stage != PipelineStage::Persisted {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                PipelineStage::ComplianceCheck,
                PipelineStage::Discovery,
                PipelineStage::Deduplication,
                PipelineStage::Enrichment,
                PipelineStage::Persisted,
            ]
        );
        assert!(PipelineStage::Deduplication < PipelineStage::Enrichment);
    }

    #[test]
    fn email_domain_from_website() {
        let mut org = OrgDescriptor {
            name: "Acme Co".into(),
            website: Some("https://www.Acme.example/about".into()),
            social_profile_url: None,
            region_code: None,
        };
        assert_eq!(org.email_domain().as_deref(), Some("acme.example"));

        org.website = Some("acme.example".into());
        assert_eq!(org.email_domain().as_deref(), Some("acme.example"));

        org.website = None;
        assert!(org.email_domain().is_none());
    }

    #[test]
    fn audit_details_are_tagged() {
        let details = AuditDetails::Completed {
            contacts: 2,
            emails: 5,
        };
        let json = serde_json::to_string(&details).expect("serialize");
        assert!(json.contains(r#""event":"completed""#));
        assert_eq!(details.event_type(), AuditEventType::Completed);

        let parsed: AuditDetails = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, details);
    }
}
