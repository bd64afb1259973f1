//! Merge candidate contacts from all sources into canonical contacts.
//!
//! Candidates below the confidence threshold are dropped, the rest are grouped
//! by canonical key (normalized profile URL, else normalized
//! `first_last`) and each group is folded into one [`EnrichedContact`].
//! Output is independent of input order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use contactforge_shared::{CandidateContact, EnrichedContact, JobId, PipelineConfig};
use sha2::{Digest, Sha256};

use crate::similarity::normalize;

/// Contact deduplicator configured with the confidence threshold.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    min_confidence: u8,
    lawful_basis: String,
}

impl Deduplicator {
    pub fn new(min_confidence: u8, lawful_basis: impl Into<String>) -> Self {
        Self {
            min_confidence,
            lawful_basis: lawful_basis.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.min_confidence, config.lawful_basis.clone())
    }

    pub fn min_confidence(&self) -> u8 {
        self.min_confidence
    }

    /// Identity used to decide that two candidates are the same person.
    ///
    /// `None` when a candidate has neither a profile URL nor a name.
    pub fn canonical_key(candidate: &CandidateContact) -> Option<String> {
        if let Some(url) = candidate.profile_url.as_deref().and_then(normalize_profile_url) {
            return Some(format!("url:{url}"));
        }
        let first = normalize(&candidate.first_name);
        let last = normalize(&candidate.last_name);
        if first.is_empty() && last.is_empty() {
            return None;
        }
        Some(format!("name:{first}_{last}"))
    }

    /// Stable row key derived from the canonical key.
    pub fn natural_key(canonical_key: &str) -> String {
        format!("{:x}", Sha256::digest(canonical_key.as_bytes()))
    }

    /// Filter, group and merge `candidates` into canonical contacts for `job_id`.
    ///
    /// Contacts come back sorted by natural key; ids are left empty for the
    /// store to assign.
    pub fn merge(
        &self,
        job_id: &JobId,
        organization_id: Option<&str>,
        candidates: &[CandidateContact],
    ) -> Vec<EnrichedContact> {
        let mut groups: BTreeMap<String, Vec<&CandidateContact>> = BTreeMap::new();
        for candidate in candidates {
            if candidate.confidence < self.min_confidence {
                continue;
            }
            if let Some(key) = Self::canonical_key(candidate) {
                groups.entry(key).or_default().push(candidate);
            }
        }

        let mut contacts: Vec<EnrichedContact> = groups
            .into_iter()
            .map(|(key, mut members)| {
                members.sort_by(|a, b| rank(a, b));
                self.fold(job_id, organization_id, &key, &members)
            })
            .collect();
        contacts.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        contacts
    }

    /// Fold one group; `members` is sorted best-first.
    fn fold(
        &self,
        job_id: &JobId,
        organization_id: Option<&str>,
        key: &str,
        members: &[&CandidateContact],
    ) -> EnrichedContact {
        let primary = members[0];

        let sources: BTreeSet<&str> = members.iter().map(|m| m.source.as_str()).collect();
        let provenance: BTreeSet<String> = members
            .iter()
            .map(|m| format!("{}: {}", m.source, m.discovery_method))
            .collect();

        EnrichedContact {
            id: String::new(),
            job_id: job_id.clone(),
            organization_id: organization_id.map(String::from),
            natural_key: Self::natural_key(key),
            first_name: primary.first_name.trim().to_string(),
            last_name: primary.last_name.trim().to_string(),
            job_title: first_some(members, |c| c.job_title.as_ref()),
            organization: first_some(members, |c| c.organization.as_ref()),
            profile_url: first_some(members, |c| c.profile_url.as_ref()),
            confidence: members.iter().map(|m| m.confidence).max().unwrap_or(0),
            sources: sources.into_iter().map(String::from).collect(),
            lawful_basis: self.lawful_basis.clone(),
            compliance_checked: true,
            notes: format!(
                "discovered via {}",
                provenance.into_iter().collect::<Vec<_>>().join("; ")
            ),
            verified_at: None,
            approved_at: None,
        }
    }
}

/// First value present in best-first order.
fn first_some<'a>(
    members: &[&'a CandidateContact],
    field: impl Fn(&'a CandidateContact) -> Option<&'a String>,
) -> Option<String> {
    members.iter().find_map(|m| field(*m).cloned())
}

/// Total order putting the most trusted candidate first: higher confidence,
/// then smaller source id, then field values.
fn rank(a: &CandidateContact, b: &CandidateContact) -> Ordering {
    b.confidence
        .cmp(&a.confidence)
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.first_name.cmp(&b.first_name))
        .then_with(|| a.last_name.cmp(&b.last_name))
        .then_with(|| a.job_title.cmp(&b.job_title))
        .then_with(|| a.organization.cmp(&b.organization))
        .then_with(|| a.profile_url.cmp(&b.profile_url))
        .then_with(|| a.discovery_method.cmp(&b.discovery_method))
}

/// `https://www.LinkedIn.com/in/JaneDoe/?trk=x` → `linkedin.com/in/janedoe`.
fn normalize_profile_url(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    let end = without_www.find(['?', '#']).unwrap_or(without_www.len());
    let trimmed = without_www[..end].trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(first: &str, last: &str, title: &str, confidence: u8, source: &str) -> CandidateContact {
        CandidateContact {
            first_name: first.into(),
            last_name: last.into(),
            job_title: Some(title.into()),
            organization: None,
            profile_url: None,
            confidence,
            source: source.into(),
            discovery_method: "test".into(),
        }
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(60, "legitimate_interest")
    }

    #[test]
    fn acme_example_keeps_higher_confidence_title() {
        let job = JobId::new();
        let merged = dedup().merge(
            &job,
            Some("org-1"),
            &[
                candidate("Jane", "Doe", "CMO", 90, "A"),
                candidate("jane", "  DOE ", "Chief Marketing Officer", 70, "B"),
            ],
        );

        assert_eq!(merged.len(), 1);
        let jane = &merged[0];
        assert_eq!(jane.full_name(), "Jane Doe");
        assert_eq!(jane.confidence, 90);
        assert_eq!(jane.job_title.as_deref(), Some("CMO"));
        assert_eq!(jane.sources, vec!["A", "B"]);
        assert_eq!(jane.organization_id.as_deref(), Some("org-1"));
        assert!(jane.compliance_checked);
    }

    #[test]
    fn below_threshold_is_dropped_before_merge() {
        let merged = dedup().merge(
            &JobId::new(),
            None,
            &[
                candidate("Jane", "Doe", "CMO", 59, "A"),
                candidate("John", "Roe", "CTO", 60, "A"),
            ],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].first_name, "John");
    }

    #[test]
    fn union_fills_missing_fields_from_weaker_sources() {
        let mut strong = candidate("Jane", "Doe", "CMO", 90, "directory");
        strong.job_title = None;
        let mut weak = candidate("Jane", "Doe", "Marketing Lead", 65, "website");
        weak.organization = Some("Acme Co".into());

        let merged = dedup().merge(&JobId::new(), None, &[strong, weak]);
        assert_eq!(merged[0].job_title.as_deref(), Some("Marketing Lead"));
        assert_eq!(merged[0].organization.as_deref(), Some("Acme Co"));
        assert_eq!(merged[0].confidence, 90);
    }

    #[test]
    fn equal_confidence_tie_breaks_on_source() {
        let a = candidate("Jane", "Doe", "CMO", 80, "alpha");
        let b = candidate("Jane", "Doe", "Chief Marketing Officer", 80, "beta");
        let job = JobId::new();
        let one = dedup().merge(&job, None, &[a.clone(), b.clone()]);
        let two = dedup().merge(&job, None, &[b, a]);
        assert_eq!(one[0].job_title.as_deref(), Some("CMO"));
        assert_eq!(two[0].job_title.as_deref(), Some("CMO"));
    }

    #[test]
    fn profile_url_takes_precedence_over_name() {
        let mut a = candidate("Jane", "Doe", "CMO", 90, "A");
        a.profile_url = Some("https://www.linkedin.com/in/JaneDoe/".into());
        let mut b = candidate("J.", "Doe", "CMO", 70, "B");
        b.profile_url = Some("http://linkedin.com/in/janedoe?trk=abc".into());
        let c = candidate("Jane", "Doe", "CMO", 75, "C");

        let merged = dedup().merge(&JobId::new(), None, &[a, b, c]);
        // Same URL merges despite different names; the URL-less record stays separate.
        assert_eq!(merged.len(), 2);
        let with_url = merged.iter().find(|m| m.profile_url.is_some()).unwrap();
        assert_eq!(with_url.sources, vec!["A", "B"]);
    }

    #[test]
    fn output_is_order_independent() {
        let input = vec![
            candidate("Jane", "Doe", "CMO", 90, "A"),
            candidate("John", "Roe", "CTO", 70, "B"),
            candidate("Jane", "Doe", "Chief Marketing Officer", 70, "B"),
            candidate("Ann", "Lee", "COO", 88, "A"),
        ];
        let job = JobId::new();
        let forward = dedup().merge(&job, None, &input);
        let mut reversed_input = input.clone();
        reversed_input.reverse();
        let reversed = dedup().merge(&job, None, &reversed_input);

        let render = |v: &[EnrichedContact]| serde_json::to_string(v).unwrap();
        assert_eq!(render(&forward), render(&reversed));
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn natural_key_is_stable() {
        let key = Deduplicator::canonical_key(&candidate("Jane ", "DOE", "x", 90, "A")).unwrap();
        assert_eq!(key, "name:jane_doe");
        assert_eq!(Deduplicator::natural_key(&key), Deduplicator::natural_key("name:jane_doe"));
        assert_eq!(Deduplicator::natural_key(&key).len(), 64);
    }
}
