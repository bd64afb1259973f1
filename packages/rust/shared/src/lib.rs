//! Shared types, error model, and configuration for ContactForge.
//!
//! This crate is the foundation depended on by all other ContactForge crates.
//! It provides:
//! - [`ContactForgeError`]: the unified error type
//! - Domain types ([`EnrichmentJob`], [`CandidateContact`], [`EnrichedContact`], [`AuditEvent`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DirectorySourceConfig, MEMORY_QUEUE_TARGET, PipelineConfig, QueueConfig,
    RetryConfig, SourcesConfig, StorageConfig, VerificationConfig, WebsiteSourceConfig,
    WorkerConfig, api_key_from_env, config_dir, config_file_path, expand_home, init_config,
    load_config, load_config_from,
};
pub use error::{ContactForgeError, Result};
pub use types::{
    AuditDetails, AuditEvent, AuditEventType, CandidateContact, EmailCandidate, EnrichedContact,
    EnrichmentJob, JobId, JobStatus, JobStatusReport, NewJob, OrgDescriptor, PipelineStage,
    VerificationStatus,
};
