//! Company website team-page adapter.
//!
//! Fetches well-known team/about paths on the organization's website and
//! extracts people from, in order of trust:
//! 1. JSON-LD `Person` objects
//! 2. schema.org `Person` microdata
//! 3. common team-card layouts (`.team-member`, `.person`, ...)

use std::time::Duration;

use async_trait::async_trait;
use contactforge_shared::{CandidateContact, ContactForgeError, OrgDescriptor, Result};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{SourceAdapter, clean_text, split_name};
use crate::build_client;

const SOURCE_NAME: &str = "website";

const JSON_LD_CONFIDENCE: u8 = 85;
const MICRODATA_CONFIDENCE: u8 = 80;
const TEAM_CARD_CONFIDENCE: u8 = 65;

/// Pages larger than this are not parsed.
const MAX_PAGE_BYTES: usize = 5 * 1024 * 1024;

struct Selectors {
    json_ld: Selector,
    person_microdata: Selector,
    item_name: Selector,
    item_title: Selector,
    card: Selector,
    card_name: Selector,
    card_title: Selector,
    link: Selector,
}

impl Selectors {
    fn new() -> Result<Self> {
        let parse = |s: &str| {
            Selector::parse(s)
                .map_err(|e| ContactForgeError::parse(format!("invalid selector '{s}': {e}")))
        };
        Ok(Self {
            json_ld: parse(r#"script[type="application/ld+json"]"#)?,
            person_microdata: parse(r#"[itemtype*="schema.org/Person"]"#)?,
            item_name: parse(r#"[itemprop="name"]"#)?,
            item_title: parse(r#"[itemprop="jobTitle"]"#)?,
            card: parse(
                ".team-member, .team-card, .person, .staff-member, .leadership-member, .member-card",
            )?,
            card_name: parse(".name, h2, h3, h4, strong")?,
            card_title: parse(".title, .role, .position, .job-title, p")?,
            link: parse("a[href]")?,
        })
    }
}

/// Adapter that scrapes people from the organization's own website.
pub struct WebsiteTeamAdapter {
    client: Client,
    paths: Vec<String>,
    selectors: Selectors,
    profile_link: Regex,
}

impl WebsiteTeamAdapter {
    pub fn new(paths: Vec<String>, timeout: Duration) -> Result<Self> {
        let profile_link = Regex::new(r"^https?://([a-z]{2,3}\.)?linkedin\.com/in/[^/?#]+")
            .map_err(|e| ContactForgeError::parse(e.to_string()))?;
        Ok(Self {
            client: build_client(timeout)?,
            paths,
            selectors: Selectors::new()?,
            profile_link,
        })
    }

    /// Fetch one page. `Ok(None)` for pages that do not exist.
    async fn fetch(&self, url: &Url) -> Result<Option<String>> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ContactForgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ContactForgeError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ContactForgeError::Network(format!("{url}: failed to read body: {e}")))?;
        if body.len() > MAX_PAGE_BYTES {
            warn!(%url, bytes = body.len(), "page too large, skipping");
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Extract candidates from one HTML page.
    pub(crate) fn extract(
        &self,
        html: &str,
        org: &OrgDescriptor,
        path: &str,
    ) -> Vec<CandidateContact> {
        let doc = Html::parse_document(html);
        let method = format!("team page {path}");
        let mut found = Vec::new();

        for script in doc.select(&self.selectors.json_ld) {
            let raw = script.text().collect::<String>();
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => collect_json_ld(&value, &mut |person: &Value| {
                    if let Some(c) = self.json_ld_person(person, org, &method) {
                        found.push(c);
                    }
                }),
                Err(e) => debug!(error = %e, "ignoring malformed JSON-LD block"),
            }
        }

        for item in doc.select(&self.selectors.person_microdata) {
            let name = first_text(item, &self.selectors.item_name);
            let title = first_text(item, &self.selectors.item_title);
            let profile = self.profile_url(item);
            if let Some(c) =
                self.candidate(name, title, profile, MICRODATA_CONFIDENCE, org, &method)
            {
                found.push(c);
            }
        }

        // Team cards only when the page carries no structured markup.
        if found.is_empty() {
            for card in doc.select(&self.selectors.card) {
                let name = first_text(card, &self.selectors.card_name);
                let title = first_text(card, &self.selectors.card_title)
                    .filter(|t| Some(t) != name.as_ref());
                let profile = self.profile_url(card);
                if let Some(c) =
                    self.candidate(name, title, profile, TEAM_CARD_CONFIDENCE, org, &method)
                {
                    found.push(c);
                }
            }
        }

        found
    }

    fn json_ld_person(
        &self,
        person: &Value,
        org: &OrgDescriptor,
        method: &str,
    ) -> Option<CandidateContact> {
        let name = match (person.get("givenName"), person.get("familyName")) {
            (Some(Value::String(given)), Some(Value::String(family))) => {
                Some(format!("{given} {family}"))
            }
            _ => person.get("name").and_then(Value::as_str).map(String::from),
        };
        let title = person
            .get("jobTitle")
            .and_then(Value::as_str)
            .and_then(clean_text);
        let profile = match person.get("sameAs") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .find(|u| self.profile_link.is_match(u))
                .map(String::from),
            _ => None,
        }
        .filter(|u| self.profile_link.is_match(u));

        self.candidate(name, title, profile, JSON_LD_CONFIDENCE, org, method)
    }

    fn candidate(
        &self,
        name: Option<String>,
        title: Option<String>,
        profile_url: Option<String>,
        confidence: u8,
        org: &OrgDescriptor,
        method: &str,
    ) -> Option<CandidateContact> {
        let (first_name, last_name) = split_name(&name?)?;
        Some(CandidateContact {
            first_name,
            last_name,
            job_title: title,
            organization: Some(org.name.clone()),
            profile_url,
            confidence,
            source: SOURCE_NAME.into(),
            discovery_method: method.to_string(),
        })
    }

    fn profile_url(&self, el: ElementRef<'_>) -> Option<String> {
        el.select(&self.selectors.link)
            .filter_map(|a| a.value().attr("href"))
            .find(|href| self.profile_link.is_match(href))
            .map(String::from)
    }
}

#[async_trait]
impl SourceAdapter for WebsiteTeamAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[instrument(skip_all, fields(source = SOURCE_NAME, org = %org.name))]
    async fn discover(&self, org: &OrgDescriptor) -> Result<Vec<CandidateContact>> {
        let Some(website) = org.website.as_deref().map(str::trim).filter(|w| !w.is_empty()) else {
            debug!("no website, nothing to scrape");
            return Ok(Vec::new());
        };
        let base = Url::parse(website)
            .or_else(|_| Url::parse(&format!("https://{website}")))
            .map_err(|e| ContactForgeError::validation(format!("invalid website '{website}': {e}")))?;

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        for path in &self.paths {
            let url = base
                .join(path)
                .map_err(|e| ContactForgeError::validation(format!("invalid path '{path}': {e}")))?;
            match self.fetch(&url).await {
                Ok(Some(html)) => {
                    let found = self.extract(&html, org, path);
                    debug!(%url, found = found.len(), "scraped page");
                    candidates.extend(found);
                }
                Ok(None) => debug!(%url, "page not found"),
                Err(e) => {
                    debug!(%url, error = %e, "page fetch failed");
                    errors.push(e);
                }
            }
        }

        // Every page failing at the transport level means the source is down.
        if !errors.is_empty() && errors.len() == self.paths.len() {
            return Err(errors.remove(0));
        }
        Ok(candidates)
    }
}

/// Visit every `Person` object in a JSON-LD document (`@graph`, arrays, `employee`).
fn collect_json_ld<'a>(value: &'a Value, visit: &mut dyn FnMut(&'a Value)) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_json_ld(v, visit)),
        Value::Object(map) => {
            let is_person = match map.get("@type") {
                Some(Value::String(t)) => t == "Person",
                Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("Person")),
                _ => false,
            };
            if is_person {
                visit(value);
            }
            for key in ["@graph", "employee", "employees", "member", "founder"] {
                if let Some(nested) = map.get(key) {
                    collect_json_ld(nested, visit);
                }
            }
        }
        _ => {}
    }
}

fn first_text(el: ElementRef<'_>, selector: &Selector) -> Option<String> {
    el.select(selector)
        .map(|e| e.text().collect::<String>())
        .find_map(|t| clean_text(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(paths: &[&str]) -> WebsiteTeamAdapter {
        WebsiteTeamAdapter::new(
            paths.iter().map(|p| p.to_string()).collect(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn org(website: Option<String>) -> OrgDescriptor {
        OrgDescriptor {
            name: "Acme Co".into(),
            website,
            social_profile_url: None,
            region_code: None,
        }
    }

    const TEAM_CARDS: &str = r#"
        <html><body>
          <div class="team-member">
            <h3>Jane Doe</h3>
            <p class="role">Chief Marketing Officer</p>
            <a href="https://www.linkedin.com/in/janedoe">LinkedIn</a>
          </div>
          <div class="team-member">
            <h3>Bob</h3>
            <p class="role">Mascot</p>
          </div>
          <div class="team-member">
            <h3>Dr. John Roe</h3>
            <p>Head of Partnerships</p>
            <a href="https://twitter.com/jroe">Twitter</a>
          </div>
        </body></html>"#;

    #[test]
    fn extracts_team_cards() {
        let a = adapter(&["/team"]);
        let found = a.extract(TEAM_CARDS, &org(None), "/team");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].first_name, "Jane");
        assert_eq!(found[0].job_title.as_deref(), Some("Chief Marketing Officer"));
        assert_eq!(
            found[0].profile_url.as_deref(),
            Some("https://www.linkedin.com/in/janedoe")
        );
        assert_eq!(found[0].confidence, TEAM_CARD_CONFIDENCE);
        assert_eq!(found[1].last_name, "Roe");
        assert!(found[1].profile_url.is_none());
        assert_eq!(found[1].discovery_method, "team page /team");
    }

    #[test]
    fn structured_markup_wins_over_cards() {
        let html = r#"
            <html><head>
              <script type="application/ld+json">
                {"@context": "https://schema.org", "@graph": [
                  {"@type": "Organization", "name": "Acme Co",
                   "employee": [{"@type": "Person", "givenName": "Ada", "familyName": "Lovelace",
                                 "jobTitle": "CTO", "sameAs": ["https://linkedin.com/in/ada"]}]}
                ]}
              </script>
              <script type="application/ld+json">{ not json </script>
            </head><body>
              <div itemscope itemtype="https://schema.org/Person">
                <span itemprop="name">Grace Hopper</span>
                <span itemprop="jobTitle">VP Engineering</span>
              </div>
              <div class="team-member"><h3>Card Person</h3></div>
            </body></html>"#;

        let a = adapter(&["/about"]);
        let found = a.extract(html, &org(None), "/about");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].first_name, "Ada");
        assert_eq!(found[0].confidence, JSON_LD_CONFIDENCE);
        assert_eq!(found[0].profile_url.as_deref(), Some("https://linkedin.com/in/ada"));
        assert_eq!(found[1].first_name, "Grace");
        assert_eq!(found[1].job_title.as_deref(), Some("VP Engineering"));
        assert_eq!(found[1].confidence, MICRODATA_CONFIDENCE);
    }

    #[tokio::test]
    async fn scrapes_existing_pages_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/team"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TEAM_CARDS))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/about"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let a = adapter(&["/team", "/about"]);
        let found = a.discover(&org(Some(server.uri()))).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.source == "website"));
    }

    #[tokio::test]
    async fn all_pages_failing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let a = adapter(&["/team", "/about"]);
        assert!(a.discover(&org(Some(server.uri()))).await.is_err());
    }

    #[tokio::test]
    async fn no_website_is_empty() {
        let a = adapter(&["/team"]);
        assert!(a.discover(&org(None)).await.unwrap().is_empty());
    }
}
