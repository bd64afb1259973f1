//! Fuzzy duplicate grouping for organization names.
//!
//! Kept separate from the contact [`Deduplicator`](crate::dedup::Deduplicator):
//! the two only share the string-similarity primitive and are tuned
//! independently.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::similarity::{normalize, similarity};

/// Default similarity at or above which two names are considered duplicates.
pub const DEFAULT_ORG_THRESHOLD: f64 = 0.85;

/// Legal-form tokens ignored when comparing organization names.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "ltd", "limited", "corp", "corporation", "co", "company",
    "gmbh", "ag", "sa", "plc", "bv", "the",
];

/// A set of names judged to be the same organization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrgGroup {
    /// Shortest member name, used as the display name for the group.
    pub canonical: String,
    /// All member names, sorted.
    pub members: Vec<String>,
    /// Lowest similarity between the canonical name and any member.
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct OrgMatcher {
    threshold: f64,
}

impl Default for OrgMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_ORG_THRESHOLD)
    }
}

impl OrgMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Comparable form of an organization name.
    pub fn key(name: &str) -> String {
        let normalized = normalize(name);
        let kept: Vec<&str> = normalized
            .split(' ')
            .filter(|t| !LEGAL_SUFFIXES.contains(t))
            .collect();
        if kept.is_empty() {
            normalized
        } else {
            kept.join(" ")
        }
    }

    pub fn score(&self, a: &str, b: &str) -> f64 {
        similarity(&Self::key(a), &Self::key(b))
    }

    /// Group duplicate names. Singletons are not returned.
    ///
    /// Matching is transitive (single linkage) and the result does not depend
    /// on input order.
    pub fn group_duplicates(&self, names: &[String]) -> Vec<OrgGroup> {
        let mut names: Vec<&str> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort_unstable();
        names.dedup();

        let keys: Vec<String> = names.iter().map(|n| Self::key(n)).collect();
        let mut parent: Vec<usize> = (0..names.len()).collect();

        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                if similarity(&keys[i], &keys[j]) >= self.threshold {
                    union(&mut parent, i, j);
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..names.len() {
            let root = find(&mut parent, i);
            clusters.entry(root).or_default().push(i);
        }

        let mut groups: Vec<OrgGroup> = clusters
            .into_values()
            .filter(|members| members.len() > 1)
            .map(|members| {
                let canonical_idx = members
                    .iter()
                    .copied()
                    .min_by(|&a, &b| names[a].len().cmp(&names[b].len()).then(names[a].cmp(names[b])))
                    .unwrap_or(members[0]);
                let score = members
                    .iter()
                    .map(|&m| similarity(&keys[canonical_idx], &keys[m]))
                    .fold(1.0, f64::min);
                OrgGroup {
                    canonical: names[canonical_idx].to_string(),
                    members: members.iter().map(|&m| names[m].to_string()).collect(),
                    score,
                }
            })
            .collect();
        groups.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        groups
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi] = lo;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_drops_legal_forms() {
        assert_eq!(OrgMatcher::key("Acme, Inc."), "acme");
        assert_eq!(OrgMatcher::key("The Company"), "the company");
    }

    #[test]
    fn groups_near_duplicates() {
        let matcher = OrgMatcher::default();
        let groups = matcher.group_duplicates(&names(&[
            "Acme Inc",
            "ACME Corporation",
            "Acme",
            "Globex",
            "Initech LLC",
            "Initech",
        ]));

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].canonical, "Acme");
        assert_eq!(groups[0].members, vec!["ACME Corporation", "Acme", "Acme Inc"]);
        assert_eq!(groups[1].canonical, "Initech");
        assert!(groups.iter().all(|g| g.score >= DEFAULT_ORG_THRESHOLD));
    }

    #[test]
    fn order_independent() {
        let matcher = OrgMatcher::new(0.8);
        let forward = names(&["Northwind Traders", "Northwind Trader", "Contoso"]);
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(
            matcher.group_duplicates(&forward),
            matcher.group_duplicates(&backward)
        );
    }

    #[test]
    fn distinct_names_stay_apart() {
        let matcher = OrgMatcher::default();
        assert!(matcher.group_duplicates(&names(&["Acme", "Apex", "Umbrella"])).is_empty());
        assert!(matcher.score("Acme", "Apex") < DEFAULT_ORG_THRESHOLD);
    }
}
