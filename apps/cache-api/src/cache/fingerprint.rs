//! Fingerprint Computer — derives the content-addressed keys a cache entry is
//! stored under, from most to least specific.
//!
//! - Exact:     company + role + tech stack + document type
//! - Role:      role + tech stack + document type
//! - Archetype: role archetype + tech stack + document type
//!
//! Titles are bucketed into archetypes through an `ArchetypeMap`, which is data
//! (loaded from JSON) rather than code. Unmapped titles are their own archetype.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::cache::types::{DocumentType, Fingerprints, JobContext, LookupTier};

/// Built-in buckets used when no archetype file is configured.
const DEFAULT_ARCHETYPES: &[(&str, &[&str])] = &[
    (
        "frontend",
        &[
            "frontend engineer",
            "frontend developer",
            "front end engineer",
            "front end developer",
            "react developer",
            "react engineer",
            "ui engineer",
        ],
    ),
    (
        "backend",
        &[
            "backend engineer",
            "backend developer",
            "back end engineer",
            "back end developer",
            "server engineer",
            "api engineer",
        ],
    ),
    (
        "fullstack",
        &[
            "full stack engineer",
            "full stack developer",
            "fullstack engineer",
            "fullstack developer",
        ],
    ),
    (
        "data",
        &["data engineer", "analytics engineer", "etl developer"],
    ),
    (
        "ml",
        &[
            "machine learning engineer",
            "ml engineer",
            "applied scientist",
            "ai engineer",
        ],
    ),
    (
        "infrastructure",
        &[
            "devops engineer",
            "site reliability engineer",
            "sre",
            "platform engineer",
            "infrastructure engineer",
        ],
    ),
];

// ────────────────────────────────────────────────────────────────────────────
// Archetype map
// ────────────────────────────────────────────────────────────────────────────

/// Maps normalized role titles to canonical archetypes.
#[derive(Debug, Clone, Default)]
pub struct ArchetypeMap {
    titles: HashMap<String, String>,
}

impl ArchetypeMap {
    /// Builds a map from `archetype -> [titles]` pairs. Titles are normalized.
    pub fn from_buckets<I, A, T>(buckets: I) -> Self
    where
        I: IntoIterator<Item = (A, Vec<T>)>,
        A: AsRef<str>,
        T: AsRef<str>,
    {
        let mut titles = HashMap::new();
        for (archetype, members) in buckets {
            let archetype = normalize_role(archetype.as_ref());
            for title in members {
                titles.insert(normalize_role(title.as_ref()), archetype.clone());
            }
        }
        Self { titles }
    }

    pub fn builtin() -> Self {
        Self::from_buckets(
            DEFAULT_ARCHETYPES
                .iter()
                .map(|(archetype, titles)| (*archetype, titles.to_vec())),
        )
    }

    /// Loads `{ "archetype": ["title", ...], ... }` from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read archetype map {}", path.display()))?;
        let buckets: HashMap<String, Vec<String>> = serde_json::from_str(&raw)
            .with_context(|| format!("Archetype map {} is not valid JSON", path.display()))?;
        let map = Self::from_buckets(buckets);
        info!(
            "Loaded archetype map from {} ({} titles)",
            path.display(),
            map.len()
        );
        Ok(map)
    }

    /// Canonical archetype for a title; unmapped titles are their own bucket.
    pub fn archetype_for(&self, role_normalized: &str) -> String {
        self.titles
            .get(role_normalized)
            .cloned()
            .unwrap_or_else(|| role_normalized.to_string())
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Normalization
// ────────────────────────────────────────────────────────────────────────────

/// Lower-cases a title, maps punctuation (except `+`, `#`, `.`) to spaces,
/// and collapses whitespace. "Sr. Back-End Engineer" -> "sr. back end engineer".
pub fn normalize_role(role: &str) -> String {
    let mapped: String = role
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '+' | '#' | '.') {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_company(company: &str) -> String {
    company
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed, lower-cased, de-duplicated, sorted technology tokens.
pub fn normalize_tech_stack(stack: &[String]) -> Vec<String> {
    stack
        .iter()
        .map(|t| t.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Computer
// ────────────────────────────────────────────────────────────────────────────

/// Fingerprints plus the normalized inputs they were derived from.
#[derive(Debug, Clone)]
pub struct FingerprintSet {
    pub fingerprints: Fingerprints,
    pub role_normalized: String,
    pub archetype: String,
    pub tech_stack: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FingerprintComputer {
    archetypes: ArchetypeMap,
}

impl FingerprintComputer {
    pub fn new(archetypes: ArchetypeMap) -> Self {
        Self { archetypes }
    }

    /// Computes all three fingerprint tiers for a job and document type.
    pub fn compute(&self, job: &JobContext, document_type: DocumentType) -> FingerprintSet {
        let company = normalize_company(&job.company);
        let role_normalized = normalize_role(&job.role);
        let archetype = self.archetypes.archetype_for(&role_normalized);
        let tech_stack = normalize_tech_stack(&job.tech_stack);
        let stack_key = tech_stack.join(",");
        let doc = document_type.as_str();

        let mut fingerprints = Fingerprints::new();
        fingerprints.insert(
            LookupTier::Exact,
            hash_fields(LookupTier::Exact, &[&company, &role_normalized, &stack_key, doc]),
        );
        fingerprints.insert(
            LookupTier::Role,
            hash_fields(LookupTier::Role, &[&role_normalized, &stack_key, doc]),
        );
        fingerprints.insert(
            LookupTier::Archetype,
            hash_fields(LookupTier::Archetype, &[&archetype, &stack_key, doc]),
        );

        FingerprintSet {
            fingerprints,
            role_normalized,
            archetype,
            tech_stack,
        }
    }
}

/// SHA-256 over the tier tag and length-prefixed fields, hex encoded.
fn hash_fields(tier: LookupTier, fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tier.as_str().as_bytes());
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
