//! Application configuration for ContactForge.
//!
//! User config lives at `~/.contactforge/contactforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContactForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "contactforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".contactforge";

/// Queue target selecting the in-process queue.
pub const MEMORY_QUEUE_TARGET: &str = "memory";

// ---------------------------------------------------------------------------
// Config structs (matching contactforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub verification: VerificationConfig,
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue connection target: `"memory"` or a libSQL database path.
    #[serde(default = "default_queue_target")]
    pub target: String,

    /// Seconds a dequeued job stays invisible before it is redelivered.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// How often a durable queue is polled while a dequeue blocks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Priority assigned to jobs submitted without one.
    #[serde(default = "default_priority")]
    pub default_priority: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            target: default_queue_target(),
            visibility_timeout_secs: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
            default_priority: default_priority(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_queue_target() -> String {
    "~/.contactforge/queue.db".into()
}
fn default_visibility_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    250
}
fn default_priority() -> i64 {
    100
}

/// `[workers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a single dequeue blocks before the worker re-checks for shutdown.
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            dequeue_timeout_ms: default_dequeue_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    5
}
fn default_dequeue_timeout() -> u64 {
    1000
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Deliveries allowed per job before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base; the delay before a retry is `base * 2^attempt`.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    60_000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-call timeout for each source adapter.
    #[serde(default = "default_call_timeout")]
    pub adapter_timeout_secs: u64,

    /// Per-call timeout for the email enricher.
    #[serde(default = "default_call_timeout")]
    pub enrich_timeout_secs: u64,

    /// Candidates scoring below this are dropped before merging.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    /// Region codes that fail the compliance check.
    #[serde(default)]
    pub restricted_regions: Vec<String>,

    /// Lawful-basis tag recorded on every persisted contact.
    #[serde(default = "default_lawful_basis")]
    pub lawful_basis: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_secs: default_call_timeout(),
            enrich_timeout_secs: default_call_timeout(),
            min_confidence: default_min_confidence(),
            restricted_regions: Vec::new(),
            lawful_basis: default_lawful_basis(),
        }
    }
}

impl PipelineConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }

    /// Case-insensitive membership test against `restricted_regions`.
    pub fn is_region_restricted(&self, region: &str) -> bool {
        let region = region.trim();
        self.restricted_regions
            .iter()
            .any(|r| r.trim().eq_ignore_ascii_case(region))
    }
}

fn default_call_timeout() -> u64 {
    10
}
fn default_min_confidence() -> u8 {
    60
}
fn default_lawful_basis() -> String {
    "legitimate_interest".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database holding job records and the audit log.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.contactforge/contactforge.db".into()
}

/// `[sources]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub directory: DirectorySourceConfig,

    #[serde(default)]
    pub website: WebsiteSourceConfig,
}

/// `[sources.directory]`: B2B directory API adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_directory_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_directory_key_env")]
    pub api_key_env: String,
}

impl Default for DirectorySourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_directory_url(),
            api_key_env: default_directory_key_env(),
        }
    }
}

fn default_directory_url() -> String {
    "https://api.peopledirectory.example".into()
}
fn default_directory_key_env() -> String {
    "CONTACTFORGE_DIRECTORY_API_KEY".into()
}

/// `[sources.website]`: company website team-page scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteSourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Paths tried relative to the organization website.
    #[serde(default = "default_team_paths")]
    pub paths: Vec<String>,
}

impl Default for WebsiteSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: default_team_paths(),
        }
    }
}

fn default_team_paths() -> Vec<String> {
    ["/team", "/about", "/about-us", "/leadership"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[verification]`: email verification provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_verification_url")]
    pub base_url: String,

    #[serde(default = "default_verification_key_env")]
    pub api_key_env: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_verification_url(),
            api_key_env: default_verification_key_env(),
        }
    }
}

fn default_verification_url() -> String {
    "https://api.mailcheck.example".into()
}
fn default_verification_key_env() -> String {
    "CONTACTFORGE_VERIFIER_API_KEY".into()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.pool_size == 0 {
            return Err(ContactForgeError::config("workers.pool_size must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ContactForgeError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ContactForgeError::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        if self.pipeline.min_confidence > 100 {
            return Err(ContactForgeError::config(
                "pipeline.min_confidence must be between 0 and 100",
            ));
        }
        if self.queue.target.trim().is_empty() {
            return Err(ContactForgeError::config("queue.target must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.contactforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ContactForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.contactforge/contactforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ContactForgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ContactForgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ContactForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ContactForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ContactForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ContactForgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read an API key from the env var named in config, if set and non-empty.
pub fn api_key_from_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}
