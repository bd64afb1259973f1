//! Core pipeline orchestration and domain logic for ContactForge.
//!
//! This crate ties together source discovery, deduplication, email
//! enrichment and the job queue into the worker-driven enrichment pipeline.

pub mod dedup;
pub mod enrichment;
pub mod matching;
pub mod pipeline;
pub mod service;
pub mod similarity;
pub mod worker;

pub use dedup::Deduplicator;
pub use enrichment::{EmailEnricher, EmailVerifier, HttpVerifier, PatternEnricher, Verification};
pub use matching::{OrgGroup, OrgMatcher};
pub use pipeline::{Orchestrator, PipelineReport, ProgressReporter, SilentProgress};
pub use service::{CancelOutcome, ContactWithEmails, EnrichmentService, SubmitRequest};
pub use worker::{JobRunner, PoolHandle, WorkerPool};
