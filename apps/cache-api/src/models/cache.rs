use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::cache::types::{CacheEntry, DocumentType, Fingerprints, LookupTier};

/// A row of `document_cache_entries`, without the stored embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CacheEntryRow {
    pub id: Uuid,
    pub document_type: String,
    pub exact_fingerprint: String,
    pub role_fingerprint: Option<String>,
    pub archetype_fingerprint: Option<String>,
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

impl TryFrom<CacheEntryRow> for CacheEntry {
    type Error = String;

    fn try_from(row: CacheEntryRow) -> Result<Self, Self::Error> {
        let document_type: DocumentType = row.document_type.parse()?;

        let mut fingerprints = Fingerprints::new();
        fingerprints.insert(LookupTier::Exact, row.exact_fingerprint);
        if let Some(role) = row.role_fingerprint {
            fingerprints.insert(LookupTier::Role, role);
        }
        if let Some(archetype) = row.archetype_fingerprint {
            fingerprints.insert(LookupTier::Archetype, archetype);
        }

        Ok(CacheEntry {
            id: row.id,
            document_type,
            fingerprints,
            profile_content_hash: row.profile_content_hash,
            role_normalized: row.role_normalized,
            tech_stack: row.tech_stack,
            content: row.content,
            embedding_ref: row.embedding_ref,
            model_version: row.model_version,
            hit_count: row.hit_count,
            last_hit_at: row.last_hit_at,
            created_at: row.created_at,
        })
    }
}

/// Embedding column projection used to warm the similarity index.
#[derive(Debug, Clone, FromRow)]
pub struct EmbeddingRow {
    pub embedding_ref: Uuid,
    pub embedding: Vec<f32>,
}
