//! Tier Lookup Engine — decides whether a previously generated document can be
//! reused, and records newly generated ones.
//!
//! Lookup flow: fingerprints → Exact → Role → Archetype → (embedding) Semantic.
//! Every tier filters on the caller's profile content hash, document type and
//! retired model versions. Lookups never fail: backend and embedding errors
//! degrade to `Miss`.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::fingerprint::FingerprintComputer;
use crate::cache::staleness::ContentStalenessTracker;
use crate::cache::stats::CacheStatsRecorder;
use crate::cache::store::{CacheStore, NeighborFilter, StoreError, TierQuery};
use crate::cache::types::{
    CacheEntry, CacheEntryDraft, CachedDocument, DocumentType, JobContext, LookupResult,
    LookupTier, NewCacheEntry,
};
use crate::config::CacheSettings;
use crate::embeddings::EmbeddingAdapter;

/// Result of handing a freshly generated document to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Stored {
        id: Uuid,
        embedding_ref: Option<Uuid>,
    },
    /// Another request cached this key first. The caller keeps using its own
    /// freshly generated copy; the cached one is served from the next lookup.
    AlreadyCached,
}

pub struct TierLookupEngine {
    store: Arc<dyn CacheStore>,
    fingerprints: FingerprintComputer,
    embeddings: Option<EmbeddingAdapter>,
    stats: Arc<CacheStatsRecorder>,
    settings: CacheSettings,
}

impl TierLookupEngine {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fingerprints: FingerprintComputer,
        embeddings: Option<EmbeddingAdapter>,
        stats: Arc<CacheStatsRecorder>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            fingerprints,
            embeddings,
            stats,
            settings,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Lookup
    // ────────────────────────────────────────────────────────────────────────

    pub async fn lookup(
        &self,
        job: &JobContext,
        profile_content_hash: &str,
        document_type: DocumentType,
    ) -> LookupResult {
        let result = match self.try_lookup(job, profile_content_hash, document_type).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Cache backend failed during {document_type} lookup, treating as miss: {e}");
                LookupResult::Miss
            }
        };

        match &result {
            LookupResult::Hit {
                entry,
                tier,
                similarity,
                ..
            } => {
                info!(
                    "Cache hit for {document_type} at tier {tier} (entry {}, similarity {:?})",
                    entry.id, similarity
                );
                self.stats.record_hit(document_type, *tier);
                self.spawn_record_hit(entry.id);
            }
            LookupResult::Miss => {
                debug!("Cache miss for {document_type} ({} @ {})", job.role, job.company);
                self.stats.record_miss(document_type);
            }
        }
        result
    }

    async fn try_lookup(
        &self,
        job: &JobContext,
        profile_content_hash: &str,
        document_type: DocumentType,
    ) -> Result<LookupResult, StoreError> {
        let set = self.fingerprints.compute(job, document_type);
        debug!(
            "Looking up {document_type} for '{}' (archetype '{}')",
            set.role_normalized, set.archetype
        );

        for tier in LookupTier::FINGERPRINT_TIERS {
            let Some(fingerprint) = set.fingerprints.get(tier) else {
                continue;
            };
            let candidates = self
                .store
                .get(TierQuery {
                    tier,
                    fingerprint,
                    profile_content_hash,
                    document_type,
                    retired_models: &self.settings.retired_model_versions,
                })
                .await?;

            for entry in rank_candidates(candidates, profile_content_hash) {
                if let Some(hit) = self.accept(entry, tier, None).await {
                    return Ok(hit);
                }
            }
            debug!("Tier {tier} missed for {document_type}");
        }

        self.lookup_semantic(job, profile_content_hash, document_type)
            .await
    }

    async fn lookup_semantic(
        &self,
        job: &JobContext,
        profile_content_hash: &str,
        document_type: DocumentType,
    ) -> Result<LookupResult, StoreError> {
        let Some(embeddings) = &self.embeddings else {
            return Ok(LookupResult::Miss);
        };
        if job.description.trim().is_empty() {
            return Ok(LookupResult::Miss);
        }

        let vector = match embeddings
            .embed(&job.description, self.settings.embedding_timeout)
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Semantic tier skipped for {document_type}: {e}");
                return Ok(LookupResult::Miss);
            }
        };

        let neighbors = self
            .store
            .nearest_neighbors(
                &vector,
                self.settings.semantic_top_k,
                NeighborFilter {
                    profile_content_hash,
                    document_type,
                    retired_models: &self.settings.retired_model_versions,
                    min_similarity: self.settings.semantic_similarity_threshold,
                },
            )
            .await?;

        for (entry, similarity) in neighbors {
            // Never serve another profile's document, whatever the store returned.
            if !ContentStalenessTracker::is_fresh(&entry.profile_content_hash, profile_content_hash)
                || entry.document_type != document_type
            {
                continue;
            }
            if let Some(hit) = self.accept(entry, LookupTier::Semantic, Some(similarity)).await {
                return Ok(hit);
            }
        }
        Ok(LookupResult::Miss)
    }

    /// Turns a candidate into a hit if its content parses; otherwise flags it.
    async fn accept(
        &self,
        entry: CacheEntry,
        tier: LookupTier,
        similarity: Option<f32>,
    ) -> Option<LookupResult> {
        match entry.document() {
            Ok(document) => Some(LookupResult::Hit {
                entry,
                document,
                tier,
                similarity,
            }),
            Err(reason) => {
                warn!("Cache entry {} has unreadable content ({reason}); flagging for purge", entry.id);
                if let Err(e) = self.store.flag_corrupt(entry.id).await {
                    warn!("Failed to flag cache entry {} as corrupt: {e}", entry.id);
                }
                None
            }
        }
    }

    /// Bumps usage counters off the caller's path.
    fn spawn_record_hit(&self, id: Uuid) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.record_hit(id).await {
                warn!("Failed to record hit for cache entry {id}: {e}");
            }
        });
    }

    // ────────────────────────────────────────────────────────────────────────
    // Store
    // ────────────────────────────────────────────────────────────────────────

    /// Caches a freshly generated document under all its fingerprint tiers,
    /// then attaches the job-description embedding when one can be computed.
    ///
    /// `DuplicateKey` is not an error here: it becomes `AlreadyCached`.
    /// Every other store failure is surfaced so the caller can retry once.
    pub async fn store(&self, draft: CacheEntryDraft) -> Result<StoreOutcome, StoreError> {
        if !(draft.document.is_object() || draft.document.is_array()) {
            return Err(StoreError::InvalidDraft(
                "document payload must be a JSON object or array".to_string(),
            ));
        }

        let set = self.fingerprints.compute(&draft.job, draft.document_type);
        let content = serde_json::to_value(CachedDocument {
            document: draft.document,
            job_description: draft.job.description.clone(),
            company_name: draft.job.company.clone(),
        })
        .map_err(|e| StoreError::InvalidDraft(e.to_string()))?;

        let new_entry = NewCacheEntry {
            document_type: draft.document_type,
            fingerprints: set.fingerprints,
            profile_content_hash: draft.profile_content_hash,
            role_normalized: set.role_normalized,
            tech_stack: set.tech_stack,
            content,
            model_version: draft.model_version,
        };

        let id = match self
            .store
            .store(new_entry, &self.settings.retired_model_versions)
            .await
        {
            Ok(id) => id,
            Err(StoreError::DuplicateKey { exact_fingerprint }) => {
                info!(
                    "{} for {} @ {} already cached ({exact_fingerprint}); discarding new copy",
                    draft.document_type, draft.job.role, draft.job.company
                );
                return Ok(StoreOutcome::AlreadyCached);
            }
            Err(e) => return Err(e),
        };

        let embedding_ref = self.attach_embedding(id, &draft.job.description).await;
        info!(
            "Cached {} {id} for {} @ {} (embedding: {})",
            draft.document_type,
            draft.job.role,
            draft.job.company,
            embedding_ref.is_some()
        );
        Ok(StoreOutcome::Stored { id, embedding_ref })
    }

    async fn attach_embedding(&self, id: Uuid, description: &str) -> Option<Uuid> {
        let embeddings = self.embeddings.as_ref()?;
        if description.trim().is_empty() {
            return None;
        }
        let vector = match embeddings
            .embed(description, self.settings.embedding_timeout)
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Cache entry {id} stored without embedding: {e}");
                return None;
            }
        };
        match self.store.attach_embedding(id, vector).await {
            Ok(embedding_ref) => Some(embedding_ref),
            Err(e) => {
                warn!("Failed to attach embedding to cache entry {id}: {e}");
                None
            }
        }
    }
}

/// Orders one tier's candidates: most hits first, then newest. Candidates from
/// any other profile are dropped, whatever the store returned.
fn rank_candidates(candidates: Vec<CacheEntry>, profile_content_hash: &str) -> Vec<CacheEntry> {
    let mut ranked: Vec<CacheEntry> = candidates
        .into_iter()
        .filter(|entry| {
            ContentStalenessTracker::is_fresh(&entry.profile_content_hash, profile_content_hash)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.hit_count
            .cmp(&a.hit_count)
            .then(b.created_at.cmp(&a.created_at))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::fingerprint::ArchetypeMap;
    use crate::cache::memory_store::InMemoryCacheStore;
    use crate::cache::similarity::InMemorySimilarityIndex;
    use crate::embeddings::testing::ScriptedEmbedder;

    const DIM: usize = 3;
    const BACKEND_JD: &str = "Build Go services on Postgres for our payments platform.";
    const SENIOR_BACKEND_JD: &str = "Build Go services on Postgres for our payments platform!";
    const UNRELATED_JD: &str = "Design marketing campaigns.";

    fn job(company: &str, role: &str, stack: &[&str], description: &str) -> JobContext {
        JobContext {
            company: company.to_string(),
            role: role.to_string(),
            tech_stack: stack.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
        }
    }

    fn acme_backend() -> JobContext {
        job("Acme", "Backend Engineer", &["go", "postgres"], BACKEND_JD)
    }

    fn draft(job: JobContext, profile: &str) -> CacheEntryDraft {
        CacheEntryDraft {
            job,
            document_type: DocumentType::Resume,
            profile_content_hash: profile.to_string(),
            model_version: "model-a".to_string(),
            document: json!({ "sections": [{ "title": "Experience", "bullets": ["Built X"] }] }),
        }
    }

    fn settings() -> CacheSettings {
        CacheSettings {
            semantic_similarity_threshold: 0.95,
            semantic_top_k: 5,
            embedding_timeout: Duration::from_millis(200),
            retired_model_versions: Vec::new(),
            max_entries: 100,
        }
    }

    fn embedder() -> ScriptedEmbedder {
        let mut vectors = HashMap::new();
        vectors.insert(BACKEND_JD.to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert(SENIOR_BACKEND_JD.to_string(), vec![0.99, 0.05, 0.0]);
        vectors.insert(UNRELATED_JD.to_string(), vec![0.0, 0.0, 1.0]);
        ScriptedEmbedder {
            vectors,
            ..Default::default()
        }
    }

    struct Harness {
        engine: TierLookupEngine,
        store: Arc<InMemoryCacheStore>,
        stats: Arc<CacheStatsRecorder>,
        embedder: Option<Arc<ScriptedEmbedder>>,
    }

    fn harness_with(embedder: Option<ScriptedEmbedder>, settings: CacheSettings) -> Harness {
        let store = Arc::new(InMemoryCacheStore::new(Arc::new(InMemorySimilarityIndex::new())));
        let stats = Arc::new(CacheStatsRecorder::new(None));
        let embedder = embedder.map(Arc::new);
        let embeddings = embedder
            .clone()
            .map(|e| EmbeddingAdapter::new(e, DIM));
        let engine = TierLookupEngine::new(
            store.clone(),
            FingerprintComputer::new(ArchetypeMap::builtin()),
            embeddings,
            stats.clone(),
            settings,
        );
        Harness {
            engine,
            store,
            stats,
            embedder,
        }
    }

    fn harness() -> Harness {
        harness_with(Some(embedder()), settings())
    }

    async fn stored_id(h: &Harness, d: CacheEntryDraft) -> Uuid {
        match h.engine.store(d).await.unwrap() {
            StoreOutcome::Stored { id, .. } => id,
            StoreOutcome::AlreadyCached => panic!("expected a fresh store"),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_identical_job_hits_exact_tier() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;

        let result = h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await;
        assert_eq!(result.tier(), Some(LookupTier::Exact));

        // Only the store embedded; a fingerprint hit never reaches the embedder.
        let embedder = h.embedder.as_ref().unwrap();
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_company_same_role_hits_role_tier() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;

        let other = job("Other Co", "Backend Engineer", &["postgres", "go"], BACKEND_JD);
        let result = h.engine.lookup(&other, "H1", DocumentType::Resume).await;
        assert_eq!(result.tier(), Some(LookupTier::Role));
    }

    #[tokio::test]
    async fn test_synonymous_title_hits_archetype_tier() {
        let h = harness();
        stored_id(
            &h,
            draft(job("Acme", "React Developer", &["react", "typescript"], ""), "H1"),
        )
        .await;

        let frontend = job("Globex", "Frontend Engineer", &["typescript", "react"], "");
        let result = h.engine.lookup(&frontend, "H1", DocumentType::Resume).await;
        assert_eq!(result.tier(), Some(LookupTier::Archetype));
    }

    #[tokio::test]
    async fn test_unbucketed_title_falls_through_to_semantic() {
        let h = harness();
        let id = stored_id(&h, draft(acme_backend(), "H1")).await;

        let senior = job("Acme", "Senior Backend Engineer", &["go", "postgres"], SENIOR_BACKEND_JD);
        match h.engine.lookup(&senior, "H1", DocumentType::Resume).await {
            LookupResult::Hit {
                entry,
                tier,
                similarity,
                ..
            } => {
                assert_eq!(tier, LookupTier::Semantic);
                assert_eq!(entry.id, id);
                assert!(similarity.unwrap() >= 0.95);
            }
            LookupResult::Miss => panic!("expected a semantic hit"),
        }
    }

    #[tokio::test]
    async fn test_semantic_tier_looks_past_stale_neighbours() {
        let h = harness();
        for i in 0..5 {
            let stale = job(&format!("Stale {i}"), "Backend Engineer", &["go"], SENIOR_BACKEND_JD);
            stored_id(&h, draft(stale, "H0")).await;
        }
        let fresh = stored_id(&h, draft(acme_backend(), "H1")).await;

        let senior = job("Globex", "Senior Backend Engineer", &["go", "postgres"], SENIOR_BACKEND_JD);
        match h.engine.lookup(&senior, "H1", DocumentType::Resume).await {
            LookupResult::Hit { entry, tier, .. } => {
                assert_eq!(tier, LookupTier::Semantic);
                assert_eq!(entry.id, fresh);
            }
            LookupResult::Miss => panic!("expected the fresh entry behind stale neighbours"),
        }
    }

    #[tokio::test]
    async fn test_dissimilar_description_is_a_miss() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;

        let senior = job("Acme", "Senior Backend Engineer", &["go", "postgres"], UNRELATED_JD);
        let result = h.engine.lookup(&senior, "H1", DocumentType::Resume).await;
        assert!(!result.is_hit());
    }

    #[tokio::test]
    async fn test_changed_profile_misses_every_tier_including_semantic() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;

        let result = h.engine.lookup(&acme_backend(), "H2", DocumentType::Resume).await;
        assert!(!result.is_hit());
        let senior = job("Acme", "Senior Backend Engineer", &["go", "postgres"], SENIOR_BACKEND_JD);
        assert!(!h.engine.lookup(&senior, "H2", DocumentType::Resume).await.is_hit());

        // The stale entry stays until a sweep removes it.
        assert_eq!(h.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_other_document_type_is_a_miss() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;
        let result = h.engine.lookup(&acme_backend(), "H1", DocumentType::CoverLetter).await;
        assert!(!result.is_hit());
    }

    #[tokio::test]
    async fn test_retired_model_entries_are_not_served() {
        let mut s = settings();
        s.retired_model_versions = vec!["model-a".to_string()];
        let h = harness_with(Some(embedder()), s);
        stored_id(&h, draft(acme_backend(), "H1")).await;

        assert!(!h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await.is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_embedder_degrades_to_miss() {
        let slow = ScriptedEmbedder {
            fallback: Some(vec![1.0, 0.0, 0.0]),
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let h = harness_with(Some(slow), settings());

        let result = h
            .engine
            .lookup(&acme_backend(), "H1", DocumentType::Resume)
            .await;
        assert!(!result.is_hit());
        assert_eq!(h.stats.misses(DocumentType::Resume), 1);
    }

    #[tokio::test]
    async fn test_failing_embedder_still_caches_via_fingerprints() {
        let failing = ScriptedEmbedder {
            fail: true,
            ..Default::default()
        };
        let h = harness_with(Some(failing), settings());

        match h.engine.store(draft(acme_backend(), "H1")).await.unwrap() {
            StoreOutcome::Stored { embedding_ref, .. } => assert!(embedding_ref.is_none()),
            other => panic!("unexpected outcome {other:?}"),
        }
        let result = h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await;
        assert_eq!(result.tier(), Some(LookupTier::Exact));
    }

    #[tokio::test]
    async fn test_without_embedder_semantic_tier_is_skipped() {
        let h = harness_with(None, settings());
        let id = stored_id(&h, draft(acme_backend(), "H1")).await;
        let senior = job("Acme", "Senior Backend Engineer", &["go", "postgres"], SENIOR_BACKEND_JD);
        assert!(!h.engine.lookup(&senior, "H1", DocumentType::Resume).await.is_hit());
        assert!(h.store.count().await.unwrap() == 1, "entry {id} should remain");
    }

    #[tokio::test]
    async fn test_hit_is_recorded_off_the_lookup_path() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;

        h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await;
        settle().await;

        match h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await {
            LookupResult::Hit { entry, .. } => {
                assert_eq!(entry.hit_count, 1);
                assert!(entry.last_hit_at.unwrap() >= entry.created_at);
            }
            LookupResult::Miss => panic!("expected hit"),
        }
        assert_eq!(h.stats.hits(DocumentType::Resume, LookupTier::Exact), 2);
    }

    #[tokio::test]
    async fn test_role_tier_prefers_most_hit_candidate() {
        let h = harness_with(None, settings());
        let acme = stored_id(&h, draft(acme_backend(), "H1")).await;
        let globex = stored_id(
            &h,
            draft(job("Globex", "Backend Engineer", &["go", "postgres"], ""), "H1"),
        )
        .await;

        h.store.record_hit(globex).await.unwrap();
        h.store.record_hit(globex).await.unwrap();
        h.store.record_hit(acme).await.unwrap();

        let initech = job("Initech", "Backend Engineer", &["go", "postgres"], "");
        match h.engine.lookup(&initech, "H1", DocumentType::Resume).await {
            LookupResult::Hit { entry, tier, .. } => {
                assert_eq!(tier, LookupTier::Role);
                assert_eq!(entry.id, globex);
            }
            LookupResult::Miss => panic!("expected role hit"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_content_is_a_miss_and_flagged() {
        let h = harness_with(None, settings());
        let id = stored_id(&h, draft(acme_backend(), "H1")).await;
        h.store.overwrite_content_for_test(id, json!("not a document"));

        assert!(!h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await.is_hit());
        assert_eq!(h.store.purge_corrupt().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_store_reports_already_cached() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;
        let second = h.engine.store(draft(acme_backend(), "H1")).await.unwrap();
        assert_eq!(second, StoreOutcome::AlreadyCached);
        assert_eq!(h.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_model_upgrade_replaces_retired_entry() {
        let h = harness_with(None, settings());
        let old = stored_id(&h, draft(acme_backend(), "H1")).await;

        let mut upgraded = settings();
        upgraded.retired_model_versions = vec!["model-a".to_string()];
        let engine = TierLookupEngine::new(
            h.store.clone(),
            FingerprintComputer::new(ArchetypeMap::builtin()),
            None,
            h.stats.clone(),
            upgraded,
        );

        let mut regenerated = draft(acme_backend(), "H1");
        regenerated.model_version = "model-b".to_string();
        let id = match engine.store(regenerated).await.unwrap() {
            StoreOutcome::Stored { id, .. } => id,
            StoreOutcome::AlreadyCached => panic!("retired entry must not block the new one"),
        };
        assert_ne!(id, old);
        assert_eq!(h.store.count().await.unwrap(), 1);

        match engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await {
            LookupResult::Hit { entry, .. } => {
                assert_eq!(entry.id, id);
                assert_eq!(entry.model_version, "model-b");
            }
            LookupResult::Miss => panic!("expected the regenerated entry"),
        }
    }

    #[tokio::test]
    async fn test_regenerated_document_replaces_corrupt_entry() {
        let h = harness_with(None, settings());
        let old = stored_id(&h, draft(acme_backend(), "H1")).await;
        h.store.overwrite_content_for_test(old, json!("not a document"));
        assert!(!h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await.is_hit());

        let id = stored_id(&h, draft(acme_backend(), "H1")).await;
        assert_ne!(id, old);
        match h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await {
            LookupResult::Hit { entry, tier, .. } => {
                assert_eq!(tier, LookupTier::Exact);
                assert_eq!(entry.id, id);
            }
            LookupResult::Miss => panic!("expected the regenerated entry"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_leave_exactly_one_entry() {
        let h = Arc::new(harness_with(None, settings()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { h.engine.store(draft(acme_backend(), "H1")).await })
            })
            .collect();

        let mut stored = 0;
        let mut yielded = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                StoreOutcome::Stored { .. } => stored += 1,
                StoreOutcome::AlreadyCached => yielded += 1,
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(yielded, 15);
        assert_eq!(h.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_unstructured_document() {
        let h = harness();
        let mut d = draft(acme_backend(), "H1");
        d.document = json!("plain prose");
        assert!(matches!(
            h.engine.store(d).await,
            Err(StoreError::InvalidDraft(_))
        ));
    }

    #[tokio::test]
    async fn test_stored_content_keeps_job_text_and_company() {
        let h = harness();
        stored_id(&h, draft(acme_backend(), "H1")).await;
        match h.engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await {
            LookupResult::Hit { document, entry, .. } => {
                assert_eq!(document.company_name, "Acme");
                assert_eq!(document.job_description, BACKEND_JD);
                assert_eq!(entry.role_normalized, "backend engineer");
                assert_eq!(entry.tech_stack, vec!["go".to_string(), "postgres".to_string()]);
            }
            LookupResult::Miss => panic!("expected hit"),
        }
    }

    // ── Backend failure ─────────────────────────────────────────────────────

    struct UnavailableStore;

    fn unavailable() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl CacheStore for UnavailableStore {
        async fn store(&self, _: NewCacheEntry, _: &[String]) -> Result<Uuid, StoreError> {
            Err(unavailable())
        }
        async fn get(&self, _: TierQuery<'_>) -> Result<Vec<CacheEntry>, StoreError> {
            Err(unavailable())
        }
        async fn nearest_neighbors(
            &self,
            _: &[f32],
            _: usize,
            _: NeighborFilter<'_>,
        ) -> Result<Vec<(CacheEntry, f32)>, StoreError> {
            Err(unavailable())
        }
        async fn attach_embedding(&self, _: Uuid, _: Vec<f32>) -> Result<Uuid, StoreError> {
            Err(unavailable())
        }
        async fn record_hit(&self, _: Uuid) -> Result<(), StoreError> {
            Err(unavailable())
        }
        async fn flag_corrupt(&self, _: Uuid) -> Result<(), StoreError> {
            Err(unavailable())
        }
        async fn evict(&self, _: usize) -> Result<u64, StoreError> {
            Err(unavailable())
        }
        async fn purge_stale(&self, _: &str) -> Result<u64, StoreError> {
            Err(unavailable())
        }
        async fn purge_retired_model(&self, _: &str) -> Result<u64, StoreError> {
            Err(unavailable())
        }
        async fn purge_corrupt(&self) -> Result<u64, StoreError> {
            Err(unavailable())
        }
        async fn count(&self) -> Result<u64, StoreError> {
            Err(unavailable())
        }
        async fn count_by_type(&self) -> Result<BTreeMap<DocumentType, u64>, StoreError> {
            Err(unavailable())
        }
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_closed_to_miss_but_surfaces_store_errors() {
        let stats = Arc::new(CacheStatsRecorder::new(None));
        let engine = TierLookupEngine::new(
            Arc::new(UnavailableStore),
            FingerprintComputer::new(ArchetypeMap::builtin()),
            None,
            stats.clone(),
            settings(),
        );

        assert!(!engine.lookup(&acme_backend(), "H1", DocumentType::Resume).await.is_hit());
        assert_eq!(stats.misses(DocumentType::Resume), 1);
        assert!(matches!(
            engine.store(draft(acme_backend(), "H1")).await,
            Err(StoreError::Database(_))
        ));
    }
}
