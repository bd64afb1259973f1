//! B2B people-directory API adapter.
//!
//! Queries `GET {base_url}/v1/people/search?organization=..&domain=..` with a
//! bearer key and maps the provider's person records to candidates.

use std::time::Duration;

use async_trait::async_trait;
use contactforge_shared::{CandidateContact, ContactForgeError, OrgDescriptor, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{SourceAdapter, clean_text};
use crate::build_client;

const SOURCE_NAME: &str = "directory";

/// Provider response. Confined to this module.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    people: Vec<PersonRecord>,
}

#[derive(Debug, Deserialize)]
struct PersonRecord {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    linkedin_url: Option<String>,
    /// 0.0–1.0 match score.
    #[serde(default)]
    score: Option<f64>,
}

/// Adapter for a JSON people-directory API.
pub struct DirectoryApiAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl DirectoryApiAdapter {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn to_candidate(&self, record: PersonRecord, org: &OrgDescriptor) -> Option<CandidateContact> {
        let first_name = clean_text(record.first_name.as_deref().unwrap_or_default())?;
        let last_name = clean_text(record.last_name.as_deref().unwrap_or_default())?;
        let confidence = (record.score.unwrap_or(0.5).clamp(0.0, 1.0) * 100.0).round() as u8;

        Some(CandidateContact {
            first_name,
            last_name,
            job_title: record.title.as_deref().and_then(clean_text),
            organization: record
                .company
                .as_deref()
                .and_then(clean_text)
                .or_else(|| Some(org.name.clone())),
            profile_url: record.linkedin_url.filter(|u| !u.trim().is_empty()),
            confidence,
            source: SOURCE_NAME.into(),
            discovery_method: "directory search".into(),
        })
    }
}

#[async_trait]
impl SourceAdapter for DirectoryApiAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[instrument(skip_all, fields(source = SOURCE_NAME, org = %org.name))]
    async fn discover(&self, org: &OrgDescriptor) -> Result<Vec<CandidateContact>> {
        let url = format!("{}/v1/people/search", self.base_url);
        let mut query = vec![("organization", org.name.clone())];
        if let Some(domain) = org.email_domain() {
            query.push(("domain", domain));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&query)
            .send()
            .await
            .map_err(|e| ContactForgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("organization unknown to directory");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(ContactForgeError::Network(format!("{url}: HTTP {status}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ContactForgeError::parse(format!("{url}: invalid response: {e}")))?;

        let total = body.people.len();
        let candidates: Vec<_> = body
            .people
            .into_iter()
            .filter_map(|record| self.to_candidate(record, org))
            .collect();

        debug!(total, kept = candidates.len(), "directory search finished");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn org() -> OrgDescriptor {
        OrgDescriptor {
            name: "Acme Co".into(),
            website: Some("https://www.acme.example".into()),
            social_profile_url: None,
            region_code: None,
        }
    }

    #[tokio::test]
    async fn maps_people_to_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/people/search"))
            .and(query_param("organization", "Acme Co"))
            .and(query_param("domain", "acme.example"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "people": [
                    {
                        "first_name": "Jane",
                        "last_name": "Doe",
                        "title": "Chief Marketing Officer",
                        "linkedin_url": "https://linkedin.com/in/janedoe",
                        "score": 0.92
                    },
                    { "first_name": "", "last_name": "Nameless", "score": 0.99 },
                    { "first_name": "John", "last_name": "Roe", "company": "Acme Labs" }
                ]
            })))
            .mount(&server)
            .await;

        let adapter =
            DirectoryApiAdapter::new(&server.uri(), "secret".into(), Duration::from_secs(5)).unwrap();
        let candidates = adapter.discover(&org()).await.unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].first_name, "Jane");
        assert_eq!(candidates[0].confidence, 92);
        assert_eq!(candidates[0].source, "directory");
        assert_eq!(candidates[0].organization.as_deref(), Some("Acme Co"));
        assert_eq!(candidates[1].confidence, 50);
        assert_eq!(candidates[1].organization.as_deref(), Some("Acme Labs"));
    }

    #[tokio::test]
    async fn unknown_org_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter =
            DirectoryApiAdapter::new(&server.uri(), "k".into(), Duration::from_secs(5)).unwrap();
        assert!(adapter.discover(&org()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter =
            DirectoryApiAdapter::new(&server.uri(), "k".into(), Duration::from_secs(5)).unwrap();
        let err = adapter.discover(&org()).await.unwrap_err();
        assert!(matches!(err, ContactForgeError::Network(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let adapter =
            DirectoryApiAdapter::new(&server.uri(), "k".into(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            adapter.discover(&org()).await,
            Err(ContactForgeError::Parse { .. })
        ));
    }
}
