//! Contact discovery: source adapters and the registry the orchestrator fans out to.
//!
//! Every adapter returns normalized [`CandidateContact`]s; deduplication and
//! enrichment happen downstream in `contactforge-core`.
//!
//! [`CandidateContact`]: contactforge_shared::CandidateContact

pub mod adapters;

use std::time::Duration;

use contactforge_shared::{ContactForgeError, Result};
use reqwest::Client;

pub use adapters::{DirectoryApiAdapter, SourceAdapter, SourceRegistry, WebsiteTeamAdapter};

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// User-Agent string for outbound requests.
pub const USER_AGENT: &str = concat!("ContactForge/", env!("CARGO_PKG_VERSION"));

/// Build a reqwest client with the shared defaults and a per-request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(timeout)
        .build()
        .map_err(|e| ContactForgeError::Network(format!("failed to build HTTP client: {e}")))
}
