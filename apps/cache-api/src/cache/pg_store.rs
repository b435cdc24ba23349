//! Postgres `CacheStore`.
//!
//! Uniqueness is enforced by the `document_cache_exact_key` constraint, so two
//! racing `store()` calls leave exactly one row. A corrupt or retired occupant
//! is deleted in the same transaction as the insert that replaces it. Hits are
//! single-row atomic increments. Eviction picks victims with `FOR UPDATE SKIP LOCKED` and never
//! waits on rows held elsewhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::similarity::SimilarityIndex;
use crate::cache::store::{CacheStore, NeighborFilter, StoreError, TierQuery};
use crate::cache::types::{CacheEntry, DocumentType, LookupTier, NewCacheEntry};
use crate::models::cache::{CacheEntryRow, EmbeddingRow};

/// Every column except the stored vector and the corrupt flag.
const ENTRY_COLUMNS: &str = "id, document_type, exact_fingerprint, role_fingerprint, \
     archetype_fingerprint, profile_content_hash, role_normalized, tech_stack, content, \
     embedding_ref, model_version, hit_count, last_hit_at, created_at";

#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
    index: Arc<dyn SimilarityIndex>,
}

impl PgCacheStore {
    pub fn new(pool: PgPool, index: Arc<dyn SimilarityIndex>) -> Self {
        Self { pool, index }
    }

    /// Loads every persisted embedding into the similarity index.
    pub async fn warm_index(&self) -> Result<usize, StoreError> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            r#"
            SELECT embedding_ref, embedding
            FROM document_cache_entries
            WHERE embedding_ref IS NOT NULL AND embedding IS NOT NULL AND NOT flagged_corrupt
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let loaded = rows.len();
        for row in rows {
            self.index.insert(row.embedding_ref, row.embedding);
        }
        info!("Warmed similarity index with {loaded} embeddings");
        Ok(loaded)
    }

    fn fingerprint_column(tier: LookupTier) -> Option<&'static str> {
        match tier {
            LookupTier::Exact => Some("exact_fingerprint"),
            LookupTier::Role => Some("role_fingerprint"),
            LookupTier::Archetype => Some("archetype_fingerprint"),
            LookupTier::Semantic => None,
        }
    }

    /// Converts rows. Rows that cannot be mapped are skipped and flagged
    /// corrupt so the next sweep removes them.
    async fn into_entries(&self, rows: Vec<CacheEntryRow>) -> Vec<CacheEntry> {
        let (entries, unreadable) = split_rows(rows);
        for id in unreadable {
            if let Err(e) = self.flag_corrupt(id).await {
                warn!("Failed to flag unreadable cache row {id}: {e}");
            }
        }
        entries
    }

    fn drop_vectors(&self, refs: Vec<Option<Uuid>>) -> u64 {
        let removed = refs.len() as u64;
        for embedding_ref in refs.into_iter().flatten() {
            self.index.remove(embedding_ref);
        }
        removed
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn store(
        &self,
        entry: NewCacheEntry,
        retired_models: &[String],
    ) -> Result<Uuid, StoreError> {
        let exact = entry
            .fingerprints
            .exact()
            .ok_or(StoreError::MissingExactFingerprint)?
            .to_string();

        let mut tx = self.pool.begin().await?;

        // An occupant that can never be served gives up its key.
        let replaced: Vec<Option<Uuid>> = sqlx::query_scalar(
            r#"
            DELETE FROM document_cache_entries
            WHERE exact_fingerprint = $1
              AND profile_content_hash = $2
              AND document_type = $3
              AND (flagged_corrupt OR model_version = ANY($4))
            RETURNING embedding_ref
            "#,
        )
        .bind(&exact)
        .bind(&entry.profile_content_hash)
        .bind(entry.document_type.as_str())
        .bind(retired_models)
        .fetch_all(&mut *tx)
        .await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO document_cache_entries
                (id, document_type, exact_fingerprint, role_fingerprint, archetype_fingerprint,
                 profile_content_hash, role_normalized, tech_stack, content, model_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT ON CONSTRAINT document_cache_exact_key DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.document_type.as_str())
        .bind(&exact)
        .bind(entry.fingerprints.get(LookupTier::Role))
        .bind(entry.fingerprints.get(LookupTier::Archetype))
        .bind(&entry.profile_content_hash)
        .bind(&entry.role_normalized)
        .bind(&entry.tech_stack)
        .bind(&entry.content)
        .bind(&entry.model_version)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        if !replaced.is_empty() {
            debug!("Replaced unservable cache entry for {exact}");
            self.drop_vectors(replaced);
        }

        match inserted {
            Some(id) => {
                debug!("Stored cache entry {id}");
                Ok(id)
            }
            None => Err(StoreError::DuplicateKey {
                exact_fingerprint: exact,
            }),
        }
    }

    async fn get(&self, query: TierQuery<'_>) -> Result<Vec<CacheEntry>, StoreError> {
        let Some(column) = Self::fingerprint_column(query.tier) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM document_cache_entries
            WHERE {column} = $1
              AND profile_content_hash = $2
              AND document_type = $3
              AND NOT (model_version = ANY($4))
              AND NOT flagged_corrupt
            "#
        );
        let rows = sqlx::query_as::<_, CacheEntryRow>(&sql)
            .bind(query.fingerprint)
            .bind(query.profile_content_hash)
            .bind(query.document_type.as_str())
            .bind(query.retired_models)
            .fetch_all(&self.pool)
            .await?;

        Ok(self.into_entries(rows).await)
    }

    async fn nearest_neighbors(
        &self,
        embedding: &[f32],
        k: usize,
        filter: NeighborFilter<'_>,
    ) -> Result<Vec<(CacheEntry, f32)>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM document_cache_entries
            WHERE embedding_ref = ANY($1)
              AND profile_content_hash = $2
              AND document_type = $3
              AND NOT (model_version = ANY($4))
              AND NOT flagged_corrupt
            "#
        );

        // Widen the index window until k candidates survive the filter or no
        // candidate above the threshold remains.
        let mut neighbors: Vec<(CacheEntry, f32)> = Vec::new();
        let mut window = k;
        let mut seen = 0;
        loop {
            let candidates = self.index.query(embedding, window);
            let exhausted = candidates.len() < window;
            let scores: HashMap<Uuid, f32> = candidates
                .iter()
                .skip(seen)
                .take_while(|(_, score)| *score >= filter.min_similarity)
                .copied()
                .collect();
            let below_threshold = seen + scores.len() < candidates.len();

            if !scores.is_empty() {
                let refs: Vec<Uuid> = scores.keys().copied().collect();
                let rows = sqlx::query_as::<_, CacheEntryRow>(&sql)
                    .bind(&refs)
                    .bind(filter.profile_content_hash)
                    .bind(filter.document_type.as_str())
                    .bind(filter.retired_models)
                    .fetch_all(&self.pool)
                    .await?;

                let mut round: Vec<(CacheEntry, f32)> = self
                    .into_entries(rows)
                    .await
                    .into_iter()
                    .filter_map(|entry| {
                        let score = *scores.get(&entry.embedding_ref?)?;
                        Some((entry, score))
                    })
                    .collect();
                round.sort_by(|a, b| b.1.total_cmp(&a.1));
                neighbors.extend(round);
            }

            if neighbors.len() >= k || exhausted || below_threshold {
                break;
            }
            seen = window;
            window = window.saturating_mul(2);
        }
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn attach_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<Uuid, StoreError> {
        let embedding_ref = Uuid::new_v4();
        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE document_cache_entries
            SET embedding_ref = $2, embedding = $3
            WHERE id = $1 AND embedding_ref IS NULL
            RETURNING embedding_ref
            "#,
        )
        .bind(id)
        .bind(embedding_ref)
        .bind(&embedding)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(embedding_ref) => {
                self.index.insert(embedding_ref, embedding);
                Ok(embedding_ref)
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn record_hit(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE document_cache_entries
            SET hit_count = hit_count + 1,
                last_hit_at = GREATEST(NOW(), created_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn flag_corrupt(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE document_cache_entries SET flagged_corrupt = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict(&self, n: usize) -> Result<u64, StoreError> {
        if n == 0 {
            return Ok(0);
        }
        let refs: Vec<Option<Uuid>> = sqlx::query_scalar(
            r#"
            DELETE FROM document_cache_entries
            WHERE id IN (
                SELECT id
                FROM document_cache_entries
                ORDER BY COALESCE(last_hit_at, created_at) ASC, hit_count ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING embedding_ref
            "#,
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.drop_vectors(refs))
    }

    async fn purge_stale(&self, current_profile_hash: &str) -> Result<u64, StoreError> {
        let refs: Vec<Option<Uuid>> = sqlx::query_scalar(
            "DELETE FROM document_cache_entries WHERE profile_content_hash <> $1 RETURNING embedding_ref",
        )
        .bind(current_profile_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.drop_vectors(refs))
    }

    async fn purge_retired_model(&self, model_version: &str) -> Result<u64, StoreError> {
        let refs: Vec<Option<Uuid>> = sqlx::query_scalar(
            "DELETE FROM document_cache_entries WHERE model_version = $1 RETURNING embedding_ref",
        )
        .bind(model_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.drop_vectors(refs))
    }

    async fn purge_corrupt(&self) -> Result<u64, StoreError> {
        let refs: Vec<Option<Uuid>> = sqlx::query_scalar(
            "DELETE FROM document_cache_entries WHERE flagged_corrupt RETURNING embedding_ref",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(self.drop_vectors(refs))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_by_type(&self) -> Result<BTreeMap<DocumentType, u64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT document_type, COUNT(*) FROM document_cache_entries GROUP BY document_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for (document_type, count) in rows {
            let document_type: DocumentType =
                document_type.parse().map_err(StoreError::InvalidRow)?;
            counts.insert(document_type, count.max(0) as u64);
        }
        Ok(counts)
    }
}

/// Maps rows to entries and collects the ids of rows that cannot be mapped.
fn split_rows(rows: Vec<CacheEntryRow>) -> (Vec<CacheEntry>, Vec<Uuid>) {
    let mut entries = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for row in rows {
        let id = row.id;
        match CacheEntry::try_from(row) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("Unreadable cache row {id}: {e}");
                unreadable.push(id);
            }
        }
    }
    (entries, unreadable)
}
