//! Core cache domain types: document kinds, lookup tiers, entries and drafts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Closed enums
// ────────────────────────────────────────────────────────────────────────────

/// The kind of generated document held by a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentType {
    Resume,
    CoverLetter,
    CoverLetterBody,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [
        DocumentType::Resume,
        DocumentType::CoverLetter,
        DocumentType::CoverLetterBody,
    ];

    /// Persisted representation. Matches the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Resume => "resume",
            DocumentType::CoverLetter => "coverLetter",
            DocumentType::CoverLetterBody => "coverLetterBody",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(DocumentType::Resume),
            "coverLetter" => Ok(DocumentType::CoverLetter),
            "coverLetterBody" => Ok(DocumentType::CoverLetterBody),
            other => Err(format!("unknown document type '{other}'")),
        }
    }
}

/// Lookup strategy, ordered from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupTier {
    Exact,
    Role,
    Archetype,
    Semantic,
}

impl LookupTier {
    /// Tiers backed by a fingerprint, in the order lookup tries them.
    pub const FINGERPRINT_TIERS: [LookupTier; 3] =
        [LookupTier::Exact, LookupTier::Role, LookupTier::Archetype];

    pub const ALL: [LookupTier; 4] = [
        LookupTier::Exact,
        LookupTier::Role,
        LookupTier::Archetype,
        LookupTier::Semantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupTier::Exact => "exact",
            LookupTier::Role => "role",
            LookupTier::Archetype => "archetype",
            LookupTier::Semantic => "semantic",
        }
    }
}

impl fmt::Display for LookupTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Job context and fingerprints
// ────────────────────────────────────────────────────────────────────────────

/// What the generator knows about the job a document is being produced for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub company: String,
    pub role: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Fingerprint per tier. Only fingerprint tiers ever appear as keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints(BTreeMap<LookupTier, String>);

impl Fingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tier: LookupTier, hash: String) {
        debug_assert!(tier != LookupTier::Semantic, "semantic tier has no fingerprint");
        self.0.insert(tier, hash);
    }

    pub fn get(&self, tier: LookupTier) -> Option<&str> {
        self.0.get(&tier).map(String::as_str)
    }

    /// The exact-tier key. Every stored entry carries one.
    pub fn exact(&self) -> Option<&str> {
        self.get(LookupTier::Exact)
    }

    /// Present fingerprints, most specific first.
    pub fn iter(&self) -> impl Iterator<Item = (LookupTier, &str)> {
        self.0.iter().map(|(tier, hash)| (*tier, hash.as_str()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Entries
// ────────────────────────────────────────────────────────────────────────────

/// The structured payload persisted as an entry's `content`.
///
/// `document` is the generated document itself (sections, bullets, paragraphs);
/// the job text and company are denormalized for diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub document: Value,
    pub job_description: String,
    pub company_name: String,
}

impl CachedDocument {
    /// Parses persisted content. Anything that is not a structured document is corrupt.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let parsed: CachedDocument =
            serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        if !(parsed.document.is_object() || parsed.document.is_array()) {
            return Err("document payload is not structured".to_string());
        }
        Ok(parsed)
    }
}

/// One generated document instance, as read back from a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: Uuid,
    pub document_type: DocumentType,
    pub fingerprints: Fingerprints,
    pub profile_content_hash: String,
    pub role_normalized: String,
    pub tech_stack: Vec<String>,
    pub content: Value,
    pub embedding_ref: Option<Uuid>,
    pub model_version: String,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn document(&self) -> Result<CachedDocument, String> {
        CachedDocument::from_value(&self.content)
    }
}

/// What the generator hands over after a miss and a successful generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryDraft {
    pub job: JobContext,
    pub document_type: DocumentType,
    pub profile_content_hash: String,
    pub model_version: String,
    /// The generated document payload.
    pub document: Value,
}

/// A draft with its fingerprints resolved, ready for a store.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub document_type: DocumentType,
    pub fingerprints: Fingerprints,
    pub profile_content_hash: String,
    pub role_normalized: String,
    pub tech_stack: Vec<String>,
    pub content: Value,
    pub model_version: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Lookup results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum LookupResult {
    Hit {
        entry: CacheEntry,
        document: CachedDocument,
        tier: LookupTier,
        /// Cosine similarity, only for semantic hits.
        similarity: Option<f32>,
    },
    Miss,
}

#[cfg(test)]
impl LookupResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, LookupResult::Hit { .. })
    }

    pub fn tier(&self) -> Option<LookupTier> {
        match self {
            LookupResult::Hit { tier, .. } => Some(*tier),
            LookupResult::Miss => None,
        }
    }
}
