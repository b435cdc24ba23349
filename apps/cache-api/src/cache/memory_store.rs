//! In-memory `CacheStore` backed by sharded `DashMap`s.
//!
//! Locking is per shard, never table-wide. Hit counters and the corrupt flag are
//! per-entry atomics, so recording a hit only needs a shared read of the shard.
//! Readers clone entries out before releasing the shard, so an eviction that
//! lands after a read never invalidates what the reader is serving.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::cache::similarity::SimilarityIndex;
use crate::cache::store::{CacheStore, NeighborFilter, StoreError, TierQuery};
use crate::cache::types::{CacheEntry, DocumentType, LookupTier, NewCacheEntry};

const NEVER_HIT: i64 = i64::MIN;

type ExactKey = (String, String, DocumentType);

struct StoredRecord {
    /// Immutable fields. Counters in this copy are never read.
    entry: CacheEntry,
    hit_count: AtomicI64,
    last_hit_at_ms: AtomicI64,
    embedding_ref: OnceLock<Uuid>,
    corrupt: AtomicBool,
}

impl StoredRecord {
    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.hit_count = self.hit_count.load(Ordering::Relaxed);
        entry.last_hit_at = match self.last_hit_at_ms.load(Ordering::Relaxed) {
            NEVER_HIT => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        };
        entry.embedding_ref = self.embedding_ref.get().copied();
        entry
    }

    /// (last used, hit count, created). Ascending order is eviction order.
    fn eviction_key(&self) -> (DateTime<Utc>, i64, DateTime<Utc>) {
        let last_used = match self.last_hit_at_ms.load(Ordering::Relaxed) {
            NEVER_HIT => self.entry.created_at,
            ms => Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or(self.entry.created_at),
        };
        (
            last_used,
            self.hit_count.load(Ordering::Relaxed),
            self.entry.created_at,
        )
    }

    fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Relaxed)
    }

    fn exact_key(&self) -> Option<ExactKey> {
        let exact = self.entry.fingerprints.exact()?;
        Some((
            exact.to_string(),
            self.entry.profile_content_hash.clone(),
            self.entry.document_type,
        ))
    }
}

pub struct InMemoryCacheStore {
    entries: DashMap<Uuid, Arc<StoredRecord>>,
    /// Uniqueness constraint: (exact fingerprint, profile hash, document type) -> id.
    exact_keys: DashMap<ExactKey, Uuid>,
    /// (tier, fingerprint) -> ids.
    by_fingerprint: DashMap<(LookupTier, String), Vec<Uuid>>,
    /// embedding_ref -> entry id.
    by_embedding: DashMap<Uuid, Uuid>,
    index: Arc<dyn SimilarityIndex>,
}

impl InMemoryCacheStore {
    pub fn new(index: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            entries: DashMap::new(),
            exact_keys: DashMap::new(),
            by_fingerprint: DashMap::new(),
            by_embedding: DashMap::new(),
            index,
        }
    }

    fn record(&self, id: Uuid) -> Option<Arc<StoredRecord>> {
        self.entries.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Removes the given entries and everything that points at them.
    fn remove_entries(&self, ids: &[Uuid]) -> u64 {
        let mut removed = 0;
        for id in ids {
            let Some(record) = self.detach(*id) else {
                continue;
            };
            if let Some(key) = record.exact_key() {
                self.exact_keys.remove_if(&key, |_, owner| owner == id);
            }
            removed += 1;
        }
        removed
    }

    /// Removes an entry and its tier and embedding links, leaving its
    /// `exact_keys` slot to the caller.
    fn detach(&self, id: Uuid) -> Option<Arc<StoredRecord>> {
        let (_, record) = self.entries.remove(&id)?;
        for (tier, fingerprint) in record.entry.fingerprints.iter() {
            let key = (tier, fingerprint.to_string());
            if let Some(mut ids) = self.by_fingerprint.get_mut(&key) {
                ids.retain(|candidate| *candidate != id);
            }
            self.by_fingerprint.remove_if(&key, |_, ids| ids.is_empty());
        }
        if let Some(embedding_ref) = record.embedding_ref.get() {
            self.by_embedding.remove(embedding_ref);
            self.index.remove(*embedding_ref);
        }
        Some(record)
    }

    /// The entry behind an index hit, if it passes the neighbour filter.
    fn surviving_neighbor(&self, embedding_ref: Uuid, filter: &NeighborFilter<'_>) -> Option<CacheEntry> {
        let id = *self.by_embedding.get(&embedding_ref)?;
        let record = self.record(id)?;
        let keep = !record.is_corrupt()
            && record.entry.profile_content_hash == filter.profile_content_hash
            && record.entry.document_type == filter.document_type
            && !filter.retired_models.contains(&record.entry.model_version);
        keep.then(|| record.snapshot())
    }

    fn select_ids(&self, predicate: impl Fn(&StoredRecord) -> bool) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|item| predicate(item.value().as_ref()))
            .map(|item| *item.key())
            .collect()
    }

    #[cfg(test)]
    pub fn overwrite_content_for_test(&self, id: Uuid, content: serde_json::Value) {
        let Some(current) = self.record(id) else {
            return;
        };
        let mut entry = current.entry.clone();
        entry.content = content;
        let replaced = StoredRecord {
            entry,
            hit_count: AtomicI64::new(current.hit_count.load(Ordering::Relaxed)),
            last_hit_at_ms: AtomicI64::new(current.last_hit_at_ms.load(Ordering::Relaxed)),
            embedding_ref: current.embedding_ref.clone(),
            corrupt: AtomicBool::new(current.is_corrupt()),
        };
        self.entries.insert(id, Arc::new(replaced));
    }

    #[cfg(test)]
    pub fn set_usage_for_test(&self, id: Uuid, hit_count: i64, last_hit_at: DateTime<Utc>) {
        if let Some(record) = self.record(id) {
            record.hit_count.store(hit_count, Ordering::Relaxed);
            record
                .last_hit_at_ms
                .store(last_hit_at.timestamp_millis(), Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn store(
        &self,
        new_entry: NewCacheEntry,
        retired_models: &[String],
    ) -> Result<Uuid, StoreError> {
        let exact = new_entry
            .fingerprints
            .exact()
            .ok_or(StoreError::MissingExactFingerprint)?
            .to_string();
        let key: ExactKey = (
            exact.clone(),
            new_entry.profile_content_hash.clone(),
            new_entry.document_type,
        );

        // The shard lock on `key` is held until the slot is filled, so racing
        // stores on the same key resolve to exactly one winner.
        let slot = self.exact_keys.entry(key);
        if let Entry::Occupied(occupied) = &slot {
            let occupant = *occupied.get();
            let servable = self.record(occupant).is_some_and(|record| {
                !record.is_corrupt() && !retired_models.contains(&record.entry.model_version)
            });
            if servable {
                return Err(StoreError::DuplicateKey {
                    exact_fingerprint: exact,
                });
            }
            // Corrupt or retired occupants can never be served; the new entry takes the slot.
            self.detach(occupant);
            debug!("Replacing unservable cache entry {occupant}");
        }

        let id = Uuid::new_v4();
        let entry = CacheEntry {
            id,
            document_type: new_entry.document_type,
            fingerprints: new_entry.fingerprints,
            profile_content_hash: new_entry.profile_content_hash,
            role_normalized: new_entry.role_normalized,
            tech_stack: new_entry.tech_stack,
            content: new_entry.content,
            embedding_ref: None,
            model_version: new_entry.model_version,
            hit_count: 0,
            last_hit_at: None,
            // Millisecond precision, matching the hit clock.
            created_at: Utc::now().trunc_subsecs(3),
        };

        for (tier, fingerprint) in entry.fingerprints.iter() {
            self.by_fingerprint
                .entry((tier, fingerprint.to_string()))
                .or_default()
                .push(id);
        }
        self.entries.insert(
            id,
            Arc::new(StoredRecord {
                entry,
                hit_count: AtomicI64::new(0),
                last_hit_at_ms: AtomicI64::new(NEVER_HIT),
                embedding_ref: OnceLock::new(),
                corrupt: AtomicBool::new(false),
            }),
        );
        slot.insert(id);

        debug!("Stored cache entry {id}");
        Ok(id)
    }

    async fn get(&self, query: TierQuery<'_>) -> Result<Vec<CacheEntry>, StoreError> {
        let ids = self
            .by_fingerprint
            .get(&(query.tier, query.fingerprint.to_string()))
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        Ok(ids
            .into_iter()
            .filter_map(|id| self.record(id))
            .filter(|record| {
                !record.is_corrupt()
                    && record.entry.profile_content_hash == query.profile_content_hash
                    && record.entry.document_type == query.document_type
                    && !query.retired_models.contains(&record.entry.model_version)
            })
            .map(|record| record.snapshot())
            .collect())
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
        // Widen the index window until k candidates survive the filter or no
        // candidate above the threshold remains.
        let mut neighbors = Vec::new();
        let mut window = k;
        let mut seen = 0;
        loop {
            let candidates = self.index.query(embedding, window);
            let exhausted = candidates.len() < window;
            let mut below_threshold = false;
            for (embedding_ref, score) in candidates.into_iter().skip(seen) {
                if score < filter.min_similarity {
                    below_threshold = true;
                    break;
                }
                if let Some(entry) = self.surviving_neighbor(embedding_ref, &filter) {
                    neighbors.push((entry, score));
                }
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
        let record = self.record(id).ok_or(StoreError::NotFound(id))?;
        let embedding_ref = Uuid::new_v4();
        if record.embedding_ref.set(embedding_ref).is_err() {
            return Err(StoreError::InvalidRow(format!(
                "entry {id} already has an embedding"
            )));
        }
        self.by_embedding.insert(embedding_ref, id);
        self.index.insert(embedding_ref, embedding);
        Ok(embedding_ref)
    }

    async fn record_hit(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self.record(id).ok_or(StoreError::NotFound(id))?;
        let now = Utc::now()
            .timestamp_millis()
            .max(record.entry.created_at.timestamp_millis());
        record.hit_count.fetch_add(1, Ordering::Relaxed);
        record.last_hit_at_ms.fetch_max(now, Ordering::Relaxed);
        Ok(())
    }

    async fn flag_corrupt(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self.record(id).ok_or(StoreError::NotFound(id))?;
        record.corrupt.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn evict(&self, n: usize) -> Result<u64, StoreError> {
        if n == 0 {
            return Ok(0);
        }
        let mut ranked: Vec<(DateTime<Utc>, i64, DateTime<Utc>, Uuid)> = self
            .entries
            .iter()
            .map(|item| {
                let (last_used, hit_count, created_at) = item.value().eviction_key();
                (last_used, hit_count, created_at, *item.key())
            })
            .collect();
        ranked.sort();

        let victims: Vec<Uuid> = ranked.into_iter().take(n).map(|(_, _, _, id)| id).collect();
        Ok(self.remove_entries(&victims))
    }

    async fn purge_stale(&self, current_profile_hash: &str) -> Result<u64, StoreError> {
        let ids = self.select_ids(|r| r.entry.profile_content_hash != current_profile_hash);
        Ok(self.remove_entries(&ids))
    }

    async fn purge_retired_model(&self, model_version: &str) -> Result<u64, StoreError> {
        let ids = self.select_ids(|r| r.entry.model_version == model_version);
        Ok(self.remove_entries(&ids))
    }

    async fn purge_corrupt(&self) -> Result<u64, StoreError> {
        let ids = self.select_ids(|r| r.is_corrupt());
        Ok(self.remove_entries(&ids))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.entries.len() as u64)
    }

    async fn count_by_type(&self) -> Result<BTreeMap<DocumentType, u64>, StoreError> {
        let mut counts = BTreeMap::new();
        for item in self.entries.iter() {
            *counts.entry(item.value().entry.document_type).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
