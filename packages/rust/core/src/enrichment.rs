//! Email enrichment: candidate generation from name patterns plus optional
//! verification against an HTTP provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use contactforge_discovery::build_client;
use contactforge_shared::{
    ContactForgeError, EmailCandidate, EnrichedContact, Result, VerificationConfig,
    VerificationStatus, api_key_from_env,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Produces email candidates for one contact.
#[async_trait]
pub trait EmailEnricher: Send + Sync {
    async fn enrich(&self, contact: &EnrichedContact, domain: &str) -> Result<Vec<EmailCandidate>>;
}

/// Verdict of a verification provider for one address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub status: VerificationStatus,
    /// 0.0–1.0.
    pub score: f64,
}

#[async_trait]
pub trait EmailVerifier: Send + Sync {
    async fn verify(&self, email: &str) -> Result<Verification>;
}

// ---------------------------------------------------------------------------
// Pattern enricher
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Pattern {
    FirstDotLast,
    FInitialLast,
    FirstLast,
    First,
    FInitialDotLast,
    FirstUnderscoreLast,
    FirstLInitial,
    Last,
}

/// Address patterns in order of how often they occur, with a prior score used
/// when no verifier is configured.
const PATTERNS: &[(Pattern, f64)] = &[
    (Pattern::FirstDotLast, 0.40),
    (Pattern::FInitialLast, 0.25),
    (Pattern::FirstLast, 0.20),
    (Pattern::First, 0.15),
    (Pattern::FInitialDotLast, 0.12),
    (Pattern::FirstUnderscoreLast, 0.10),
    (Pattern::FirstLInitial, 0.08),
    (Pattern::Last, 0.05),
];

impl Pattern {
    fn local_part(self, first: &str, last: &str) -> String {
        let f = &first[..1];
        let l = &last[..1];
        match self {
            Self::FirstDotLast => format!("{first}.{last}"),
            Self::FInitialLast => format!("{f}{last}"),
            Self::FirstLast => format!("{first}{last}"),
            Self::First => first.to_string(),
            Self::FInitialDotLast => format!("{f}.{last}"),
            Self::FirstUnderscoreLast => format!("{first}_{last}"),
            Self::FirstLInitial => format!("{first}{l}"),
            Self::Last => last.to_string(),
        }
    }
}

/// Lowercase ASCII letters and digits only; `"Van Doe"` → `"vandoe"`.
fn local_token(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Generates addresses from common corporate patterns and, when a verifier
/// is configured, keeps only the ones it does not reject.
#[derive(Clone, Default)]
pub struct PatternEnricher {
    verifier: Option<Arc<dyn EmailVerifier>>,
}

impl PatternEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verifier(verifier: Arc<dyn EmailVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    /// Build from the `[verification]` section; a missing API key disables verification.
    pub fn from_config(config: &VerificationConfig, timeout: Duration) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::new());
        }
        match api_key_from_env(&config.api_key_env) {
            Some(key) => Ok(Self::with_verifier(Arc::new(HttpVerifier::new(
                &config.base_url,
                key,
                timeout,
            )?))),
            None => {
                warn!(
                    env = %config.api_key_env,
                    "verification enabled but API key not set, emitting unverified candidates"
                );
                Ok(Self::new())
            }
        }
    }

    /// Candidate addresses for a name at `domain`, best pattern first.
    pub fn candidates(first_name: &str, last_name: &str, domain: &str) -> Vec<(String, f64)> {
        let first = local_token(first_name);
        let last = local_token(last_name);
        let domain = domain.trim().trim_start_matches('@').to_ascii_lowercase();
        if first.is_empty() || last.is_empty() || !valid_domain(&domain) {
            return Vec::new();
        }

        let mut seen = std::collections::HashSet::new();
        PATTERNS
            .iter()
            .map(|(pattern, prior)| (format!("{}@{domain}", pattern.local_part(&first, &last)), *prior))
            .filter(|(email, _)| seen.insert(email.clone()))
            .collect()
    }
}

#[async_trait]
impl EmailEnricher for PatternEnricher {
    async fn enrich(&self, contact: &EnrichedContact, domain: &str) -> Result<Vec<EmailCandidate>> {
        let generated = Self::candidates(&contact.first_name, &contact.last_name, domain);
        if generated.is_empty() {
            debug!(contact = %contact.full_name(), domain, "no usable name/domain for patterns");
            return Ok(Vec::new());
        }

        let Some(verifier) = &self.verifier else {
            return Ok(generated
                .into_iter()
                .map(|(email, prior)| EmailCandidate {
                    email,
                    status: VerificationStatus::Unverified,
                    score: prior,
                })
                .collect());
        };

        let mut verified = Vec::new();
        for (email, _) in generated {
            match verifier.verify(&email).await {
                Ok(v) if v.status == VerificationStatus::Invalid => {}
                Ok(v) => {
                    let done = v.status == VerificationStatus::Valid;
                    verified.push(EmailCandidate {
                        email,
                        status: v.status,
                        score: v.score.clamp(0.0, 1.0),
                    });
                    // One confirmed address is enough.
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    warn!(contact = %contact.full_name(), error = %e, "verification provider failed");
                    return Ok(Vec::new());
                }
            }
        }

        verified.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.email.cmp(&b.email)));
        Ok(verified)
    }
}

// ---------------------------------------------------------------------------
// HTTP verification provider
// ---------------------------------------------------------------------------

/// Provider response. Confined to this module.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Client for a JSON verification API: `GET {base_url}/v1/verify?email=..`.
pub struct HttpVerifier {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpVerifier {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

fn map_status(raw: &str) -> VerificationStatus {
    match raw.to_ascii_lowercase().as_str() {
        "valid" | "deliverable" => VerificationStatus::Valid,
        "risky" | "accept_all" | "catch_all" => VerificationStatus::Risky,
        "invalid" | "undeliverable" => VerificationStatus::Invalid,
        _ => VerificationStatus::Unverified,
    }
}

#[async_trait]
impl EmailVerifier for HttpVerifier {
    async fn verify(&self, email: &str) -> Result<Verification> {
        let url = format!("{}/v1/verify", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("email", email)])
            .send()
            .await
            .map_err(|e| ContactForgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ContactForgeError::Network(format!("{url}: HTTP {status}")));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| ContactForgeError::parse(format!("{url}: invalid response: {e}")))?;

        let status = map_status(&body.status);
        let score = body.score.unwrap_or(match status {
            VerificationStatus::Valid => 0.9,
            VerificationStatus::Risky => 0.5,
            VerificationStatus::Unverified => 0.3,
            VerificationStatus::Invalid => 0.0,
        });
        Ok(Verification { status, score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contactforge_shared::JobId;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn contact(first: &str, last: &str) -> EnrichedContact {
        EnrichedContact {
            id: "c1".into(),
            job_id: JobId::new(),
            organization_id: None,
            natural_key: "k".into(),
            first_name: first.into(),
            last_name: last.into(),
            job_title: None,
            organization: None,
            profile_url: None,
            confidence: 90,
            sources: vec!["directory".into()],
            lawful_basis: "legitimate_interest".into(),
            compliance_checked: true,
            notes: String::new(),
            verified_at: None,
            approved_at: None,
        }
    }

    #[test]
    fn generates_common_patterns() {
        let emails: Vec<String> = PatternEnricher::candidates("Jane", "van Doe", "Acme.example")
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(emails[0], "jane.vandoe@acme.example");
        assert!(emails.contains(&"jvandoe@acme.example".to_string()));
        assert!(emails.contains(&"janevandoe@acme.example".to_string()));
        assert_eq!(emails.len(), PATTERNS.len());
    }

    #[test]
    fn rejects_unusable_input() {
        assert!(PatternEnricher::candidates("", "Doe", "acme.example").is_empty());
        assert!(PatternEnricher::candidates("Jane", "Doe", "localhost").is_empty());
        assert!(PatternEnricher::candidates("Jane", "Doe", "bad domain.com").is_empty());
    }

    #[tokio::test]
    async fn unverified_without_provider() {
        let enricher = PatternEnricher::new();
        let found = enricher.enrich(&contact("Jane", "Doe"), "acme.example").await.unwrap();
        assert_eq!(found.len(), PATTERNS.len());
        assert!(found.iter().all(|c| c.status == VerificationStatus::Unverified));
        assert_eq!(found[0].email, "jane.doe@acme.example");
    }

    #[tokio::test]
    async fn verifier_filters_and_stops_at_first_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/verify"))
            .and(query_param("email", "jane.doe@acme.example"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "undeliverable"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/verify"))
            .and(query_param("email", "jdoe@acme.example"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "catch_all", "score": 0.4
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/verify"))
            .and(query_param("email", "janedoe@acme.example"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "valid", "score": 0.97
            })))
            .mount(&server)
            .await;

        let verifier =
            HttpVerifier::new(&server.uri(), "key".into(), Duration::from_secs(5)).unwrap();
        let enricher = PatternEnricher::with_verifier(Arc::new(verifier));
        let found = enricher.enrich(&contact("Jane", "Doe"), "acme.example").await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].email, "janedoe@acme.example");
        assert_eq!(found[0].status, VerificationStatus::Valid);
        assert_eq!(found[1].status, VerificationStatus::Risky);
    }

    #[tokio::test]
    async fn provider_outage_yields_no_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let verifier =
            HttpVerifier::new(&server.uri(), "key".into(), Duration::from_secs(5)).unwrap();
        let enricher = PatternEnricher::with_verifier(Arc::new(verifier));
        let found = enricher.enrich(&contact("Jane", "Doe"), "acme.example").await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn disabled_config_has_no_verifier() {
        let enricher =
            PatternEnricher::from_config(&VerificationConfig::default(), Duration::from_secs(1))
                .unwrap();
        assert!(enricher.verifier.is_none());
    }
}
