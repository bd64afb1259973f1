//! Source adapter trait and built-in adapters for contact discovery.
//!
//! Each adapter talks to one external source and normalizes whatever shape
//! that source returns into [`CandidateContact`]s. Raw provider payloads never
//! leave the adapter.

mod directory;
mod website;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use contactforge_shared::{CandidateContact, OrgDescriptor, Result, SourcesConfig, api_key_from_env};
use tracing::{info, warn};

pub use directory::DirectoryApiAdapter;
pub use website::WebsiteTeamAdapter;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pluggable source of candidate contacts.
///
/// Implementations must be safe to call repeatedly for the same organization;
/// the orchestrator re-runs discovery when a job is redelivered.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable adapter name, recorded as the `source` of every candidate.
    fn name(&self) -> &str;

    /// Find people working at `org`.
    ///
    /// An error marks this adapter as failed for the run; it never fails the job.
    async fn discover(&self, org: &OrgDescriptor) -> Result<Vec<CandidateContact>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds the adapters a job fans out to.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter. Later registrations with the same name replace earlier ones.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.retain(|a| a.name() != adapter.name());
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Build the registry from the `[sources]` config section.
    ///
    /// The directory adapter is skipped (with a warning) when its API key env
    /// var is unset.
    pub fn from_config(config: &SourcesConfig, timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();

        if config.directory.enabled {
            match api_key_from_env(&config.directory.api_key_env) {
                Some(key) => registry.register(Arc::new(DirectoryApiAdapter::new(
                    &config.directory.base_url,
                    key,
                    timeout,
                )?)),
                None => warn!(
                    env = %config.directory.api_key_env,
                    "directory source enabled but API key not set, skipping"
                ),
            }
        }

        if config.website.enabled {
            registry.register(Arc::new(WebsiteTeamAdapter::new(
                config.website.paths.clone(),
                timeout,
            )?));
        }

        info!(sources = ?registry.names(), "source adapters registered");
        Ok(registry)
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by adapters
// ---------------------------------------------------------------------------

/// Split a display name into `(first, last)`.
///
/// Honorifics and post-nominals are dropped; single-word names yield `None`
/// since they cannot be matched or turned into an email pattern.
pub(crate) fn split_name(full: &str) -> Option<(String, String)> {
    const PREFIXES: &[&str] = &["dr", "mr", "mrs", "ms", "prof"];
    const SUFFIXES: &[&str] = &["jr", "sr", "ii", "iii", "phd", "mba", "md"];

    let mut parts: Vec<&str> = full
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .collect();

    while let Some(first) = parts.first() {
        if PREFIXES.contains(&first.trim_end_matches('.').to_lowercase().as_str()) {
            parts.remove(0);
        } else {
            break;
        }
    }
    while let Some(last) = parts.last() {
        if SUFFIXES.contains(&last.trim_end_matches('.').to_lowercase().as_str()) {
            parts.pop();
        } else {
            break;
        }
    }

    if parts.len() < 2 || !parts.iter().all(|p| p.chars().any(char::is_alphabetic)) {
        return None;
    }
    let first = parts[0].to_string();
    let last = parts[1..].join(" ");
    Some((first, last))
}

/// Collapse runs of whitespace and trim; `None` when nothing is left.
pub(crate) fn clean_text(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl SourceAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn discover(&self, _org: &OrgDescriptor) -> Result<Vec<CandidateContact>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_replaces_same_name() {
        let registry = SourceRegistry::new()
            .with(Arc::new(Named("directory")))
            .with(Arc::new(Named("website")))
            .with(Arc::new(Named("directory")));
        assert_eq!(registry.names(), vec!["website", "directory"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn from_config_skips_directory_without_key() {
        let mut config = SourcesConfig::default();
        config.directory.api_key_env = "CF_TEST_MISSING_DIRECTORY_KEY_9876".into();
        let registry = SourceRegistry::from_config(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(registry.names(), vec!["website"]);

        config.website.enabled = false;
        let registry = SourceRegistry::from_config(&config, Duration::from_secs(5)).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn split_name_handles_titles() {
        assert_eq!(
            split_name("Dr. Jane  van Doe, PhD"),
            Some(("Jane".into(), "van Doe".into()))
        );
        assert_eq!(split_name("John Smith"), Some(("John".into(), "Smith".into())));
        assert_eq!(split_name("Cher"), None);
        assert_eq!(split_name("Team 2024"), None);
    }
}
