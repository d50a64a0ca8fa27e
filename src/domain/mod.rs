//! Domain knowledge for prompt enrichment
//!
//! This module provides:
//! - DomainId: the domains a document can be classified into
//! - DomainProvider: detection, synonym expansion and canned questions
//! - KeywordDomainRouter: provider scoring documents against static tables
//!
//! Nothing here affects query control flow; it only enriches prompt text.

pub mod tables;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Characters of a document inspected during detection
pub const DETECTION_SAMPLE_CHARS: usize = 2_000;

/// Minimum score for a domain to be chosen over `Generic`
pub const DEFAULT_THRESHOLD: f64 = 0.3;

const FILENAME_BOOST: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainId {
    Generic,
    Finance,
    Legal,
    Medical,
    Academic,
}

impl DomainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainId::Generic => "generic",
            DomainId::Finance => "finance",
            DomainId::Legal => "legal",
            DomainId::Medical => "medical",
            DomainId::Academic => "academic",
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DomainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(DomainId::Generic),
            "finance" => Ok(DomainId::Finance),
            "legal" => Ok(DomainId::Legal),
            "medical" => Ok(DomainId::Medical),
            "academic" => Ok(DomainId::Academic),
            other => Err(format!("Unknown domain: {}", other)),
        }
    }
}

/// Source of domain vocabulary
pub trait DomainProvider: Send + Sync {
    /// Classify a document; `Generic` when nothing matches well enough.
    fn detect(&self, text: &str, filename: &str) -> DomainId;

    /// Equivalent terms for `term`, always including `term` itself.
    fn expand(&self, term: &str, domain: DomainId) -> BTreeSet<String>;

    /// Canned questions for a domain, keyed by topic.
    fn query_templates(&self, domain: DomainId) -> BTreeMap<String, String>;
}

/// Size of a domain's vocabulary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub synonym_groups: usize,
    pub query_templates: usize,
    pub detection_patterns: usize,
    pub total_terms: usize,
}

impl DomainStats {
    /// Field-wise sum, for totals across domains
    pub fn add(&mut self, other: &DomainStats) {
        self.synonym_groups += other.synonym_groups;
        self.query_templates += other.query_templates;
        self.detection_patterns += other.detection_patterns;
        self.total_terms += other.total_terms;
    }
}

/// Static vocabulary for one domain
#[derive(Debug)]
pub struct DomainTable {
    pub id: DomainId,
    pub description: &'static str,
    /// Concept -> equivalent terms
    pub synonyms: &'static [(&'static str, &'static [&'static str])],
    /// Lowercase phrases whose presence suggests this domain
    pub patterns: &'static [&'static str],
    pub filename_keywords: &'static [&'static str],
    pub templates: &'static [(&'static str, &'static str)],
}

impl DomainTable {
    /// Confidence in `[0, 1]` that a document belongs here, rounded to two places.
    pub fn score(&self, text: &str, filename: &str) -> f64 {
        let text = text.to_lowercase();
        let filename = filename.to_lowercase();

        let mut score = 0.0;
        if !self.patterns.is_empty() {
            let matches = self.patterns.iter().filter(|p| text.contains(*p)).count() as f64;
            let needed = (self.patterns.len() as f64 * 0.3).max(1.0);
            score = (matches / needed).min(1.0);
        }

        for keyword in self.filename_keywords {
            if filename.contains(keyword) {
                score = (score + FILENAME_BOOST).min(1.0);
            }
        }

        (score * 100.0).round() / 100.0
    }

    pub fn stats(&self) -> DomainStats {
        DomainStats {
            synonym_groups: self.synonyms.len(),
            query_templates: self.templates.len(),
            detection_patterns: self.patterns.len(),
            total_terms: self.synonyms.iter().map(|(_, terms)| terms.len()).sum(),
        }
    }

    /// The synonym group `term` names or belongs to.
    pub fn group(&self, term: &str) -> Option<&'static [&'static str]> {
        let key = term.trim().to_lowercase().replace(' ', "_");
        self.synonyms
            .iter()
            .find(|(concept, terms)| {
                *concept == key || terms.iter().any(|t| t.eq_ignore_ascii_case(term.trim()))
            })
            .map(|(_, terms)| *terms)
    }
}

/// Provider backed by the built-in [`tables`].
#[derive(Debug, Clone)]
pub struct KeywordDomainRouter {
    tables: Vec<&'static DomainTable>,
    threshold: f64,
}

impl Default for KeywordDomainRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordDomainRouter {
    pub fn new() -> Self {
        Self {
            tables: tables::ALL.to_vec(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Registered tables, in registration order
    pub fn tables(&self) -> impl Iterator<Item = &'static DomainTable> + '_ {
        self.tables.iter().copied()
    }

    pub fn table(&self, domain: DomainId) -> Option<&'static DomainTable> {
        self.tables.iter().copied().find(|t| t.id == domain)
    }

    /// Every domain scoring at least `threshold`, best first.
    pub fn detect_multi(&self, text: &str, filename: &str, threshold: f64) -> Vec<(DomainId, f64)> {
        let sample: String = text.chars().take(DETECTION_SAMPLE_CHARS).collect();
        let mut scored: Vec<(DomainId, f64)> = self
            .tables
            .iter()
            .map(|t| (t.id, t.score(&sample, filename)))
            .filter(|(_, score)| *score > 0.0 && *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
    }

    /// Merge the synonym groups of several domains, deduplicating terms.
    pub fn compose_synonyms(&self, domains: &[DomainId]) -> BTreeMap<String, Vec<String>> {
        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for table in domains.iter().filter_map(|d| self.table(*d)) {
            for (concept, terms) in table.synonyms {
                let entry = merged.entry(concept.to_string()).or_default();
                for term in *terms {
                    if !entry.iter().any(|t| t == term) {
                        entry.push(term.to_string());
                    }
                }
            }
        }
        merged
    }
}

impl DomainProvider for KeywordDomainRouter {
    fn detect(&self, text: &str, filename: &str) -> DomainId {
        let best = self.detect_multi(text, filename, self.threshold).into_iter().next();
        match best {
            Some((domain, score)) => {
                log::debug!("Detected domain {} (score {:.2})", domain, score);
                domain
            }
            None => DomainId::Generic,
        }
    }

    fn expand(&self, term: &str, domain: DomainId) -> BTreeSet<String> {
        let mut expanded = BTreeSet::from([term.to_string()]);
        if let Some(group) = self.table(domain).and_then(|t| t.group(term)) {
            expanded.extend(group.iter().map(|t| t.to_string()));
        }
        expanded
    }

    fn query_templates(&self, domain: DomainId) -> BTreeMap<String, String> {
        self.table(domain)
            .map(|t| {
                t.templates
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
