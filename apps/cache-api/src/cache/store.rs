//! Cache Store — the durable home of cache entries and their embeddings.
//!
//! Two backends implement `CacheStore`: `PgCacheStore` (Postgres, production)
//! and `InMemoryCacheStore` (sharded maps, tests and single-process runs).
//! Both own a `SimilarityIndex` and keep it in step with their entries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::types::{CacheEntry, DocumentType, LookupTier, NewCacheEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    /// An entry already exists for (exact fingerprint, profile hash, document type).
    #[error("Entry already cached for exact fingerprint {exact_fingerprint}")]
    DuplicateKey { exact_fingerprint: String },

    #[error("Entry is missing its exact-tier fingerprint")]
    MissingExactFingerprint,

    #[error("Entry {0} not found")]
    NotFound(Uuid),

    #[error("Invalid cache row: {0}")]
    InvalidRow(String),

    #[error("Invalid document draft: {0}")]
    InvalidDraft(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A single fingerprint-tier lookup.
#[derive(Debug, Clone, Copy)]
pub struct TierQuery<'a> {
    pub tier: LookupTier,
    pub fingerprint: &'a str,
    pub profile_content_hash: &'a str,
    pub document_type: DocumentType,
    /// Entries produced by these model versions are never returned.
    pub retired_models: &'a [String],
}

/// Post-filter applied to similarity-index candidates.
#[derive(Debug, Clone, Copy)]
pub struct NeighborFilter<'a> {
    pub profile_content_hash: &'a str,
    pub document_type: DocumentType,
    pub retired_models: &'a [String],
    pub min_similarity: f32,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Persists a new entry under all its fingerprints.
    ///
    /// Fails with `DuplicateKey` while a servable entry holds the exact key.
    /// An occupant that is flagged corrupt or was produced by one of
    /// `retired_models` is removed and replaced in the same atomic step.
    async fn store(
        &self,
        entry: NewCacheEntry,
        retired_models: &[String],
    ) -> Result<Uuid, StoreError>;

    /// Live, non-corrupt entries matching one tier's fingerprint.
    async fn get(&self, query: TierQuery<'_>) -> Result<Vec<CacheEntry>, StoreError>;

    /// Up to `k` nearest entries that pass `filter`, best first. Candidates
    /// rejected by the filter do not count towards `k`.
    async fn nearest_neighbors(
        &self,
        embedding: &[f32],
        k: usize,
        filter: NeighborFilter<'_>,
    ) -> Result<Vec<(CacheEntry, f32)>, StoreError>;

    /// Stores an entry's embedding and sets its `embedding_ref`. Returns the ref.
    async fn attach_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<Uuid, StoreError>;

    /// Atomically bumps `hit_count` and sets `last_hit_at` to now.
    async fn record_hit(&self, id: Uuid) -> Result<(), StoreError>;

    /// Hides an entry from lookups until the next corrupt purge removes it.
    async fn flag_corrupt(&self, id: Uuid) -> Result<(), StoreError>;

    /// Removes up to `n` entries, least recently and least frequently used first.
    async fn evict(&self, n: usize) -> Result<u64, StoreError>;

    /// Removes every entry generated from a profile other than `current_profile_hash`.
    async fn purge_stale(&self, current_profile_hash: &str) -> Result<u64, StoreError>;

    /// Removes every entry produced by `model_version`.
    async fn purge_retired_model(&self, model_version: &str) -> Result<u64, StoreError>;

    /// Removes entries flagged as corrupt.
    async fn purge_corrupt(&self) -> Result<u64, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn count_by_type(&self) -> Result<BTreeMap<DocumentType, u64>, StoreError>;
}
