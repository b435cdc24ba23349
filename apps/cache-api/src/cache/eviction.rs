//! Eviction Manager — reclaims space from the cache.
//!
//! A sweep runs in four steps: corrupt purge, retired-model purge, optional
//! staleness purge (when the current profile hash is known), then capacity
//! eviction down to `max_entries`. Stores remove victims entry by entry, so a
//! sweep never blocks concurrent lookups.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::store::{CacheStore, StoreError};
use crate::config::CacheSettings;

/// Entries removed by one sweep, per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub corrupt: u64,
    pub retired: u64,
    pub stale: u64,
    pub evicted: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.corrupt + self.retired + self.stale + self.evicted
    }
}

pub struct EvictionManager {
    store: Arc<dyn CacheStore>,
    settings: CacheSettings,
}

impl EvictionManager {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        Self { store, settings }
    }

    /// Evicts least recently and least frequently used entries until the
    /// store holds at most `max_entries`.
    pub async fn evict_to_capacity(&self) -> Result<u64, StoreError> {
        let count = self.store.count().await?;
        let Some(excess) = count.checked_sub(self.settings.max_entries) else {
            return Ok(0);
        };
        if excess == 0 {
            return Ok(0);
        }
        debug!(
            "Cache holds {count} entries (capacity {}); evicting {excess}",
            self.settings.max_entries
        );
        self.store.evict(excess as usize).await
    }

    pub async fn sweep(&self, current_profile_hash: Option<&str>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport {
            corrupt: self.store.purge_corrupt().await?,
            ..Default::default()
        };

        for model_version in &self.settings.retired_model_versions {
            report.retired += self.store.purge_retired_model(model_version).await?;
        }

        if let Some(hash) = current_profile_hash {
            report.stale = self.store.purge_stale(hash).await?;
        }

        report.evicted = self.evict_to_capacity().await?;

        if report.total() > 0 {
            info!(
                "Cache sweep removed {} entries (corrupt {}, retired {}, stale {}, evicted {})",
                report.total(),
                report.corrupt,
                report.retired,
                report.stale,
                report.evicted
            );
        }
        Ok(report)
    }

    /// Runs `sweep(None)` every `interval` until the runtime shuts down.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup is not a sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(None).await {
                    warn!("Scheduled cache sweep failed: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use super::*;
    use crate::cache::fingerprint::{ArchetypeMap, FingerprintComputer};
    use crate::cache::memory_store::InMemoryCacheStore;
    use crate::cache::similarity::InMemorySimilarityIndex;
    use crate::cache::types::{DocumentType, JobContext, NewCacheEntry};
    use uuid::Uuid;

    fn settings(max_entries: u64, retired: &[&str]) -> CacheSettings {
        CacheSettings {
            semantic_similarity_threshold: 0.92,
            semantic_top_k: 10,
            embedding_timeout: Duration::from_millis(100),
            retired_model_versions: retired.iter().map(|s| s.to_string()).collect(),
            max_entries,
        }
    }

    fn new_store() -> Arc<InMemoryCacheStore> {
        Arc::new(InMemoryCacheStore::new(Arc::new(InMemorySimilarityIndex::new())))
    }

    async fn put(store: &InMemoryCacheStore, company: &str, profile: &str, model: &str) -> Uuid {
        let job = JobContext {
            company: company.to_string(),
            role: "Backend Engineer".to_string(),
            tech_stack: vec!["go".to_string()],
            description: String::new(),
        };
        let set = FingerprintComputer::new(ArchetypeMap::builtin()).compute(&job, DocumentType::Resume);
        store
            .store(
                NewCacheEntry {
                    document_type: DocumentType::Resume,
                    fingerprints: set.fingerprints,
                    profile_content_hash: profile.to_string(),
                    role_normalized: set.role_normalized,
                    tech_stack: set.tech_stack,
                    content: json!({ "document": { "sections": [] }, "job_description": "", "company_name": company }),
                    model_version: model.to_string(),
                },
                &[],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_under_capacity_evicts_nothing() {
        let store = new_store();
        put(&store, "Acme", "H1", "m1").await;
        let manager = EvictionManager::new(store.clone(), settings(5, &[]));
        assert_eq!(manager.evict_to_capacity().await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_removes_rarely_used_entry_first() {
        let store = new_store();
        let t0 = Utc::now() + ChronoDuration::seconds(1);
        let a = put(&store, "Acme", "H1", "m1").await;
        let b = put(&store, "Globex", "H1", "m1").await;
        let c = put(&store, "Initech", "H1", "m1").await;
        store.set_usage_for_test(a, 5, t0);
        store.set_usage_for_test(b, 1, t0);
        store.set_usage_for_test(c, 9, t0 + ChronoDuration::seconds(10));

        let manager = EvictionManager::new(store.clone(), settings(2, &[]));
        assert_eq!(manager.evict_to_capacity().await.unwrap(), 1);

        let counts = store.count_by_type().await.unwrap();
        assert_eq!(counts[&DocumentType::Resume], 2);
        // B (same recency as A, fewer hits) is gone; A and C survive.
        assert!(store.record_hit(b).await.is_err());
        assert!(store.record_hit(a).await.is_ok());
        assert!(store.record_hit(c).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_runs_every_step_and_reports_counts() {
        let store = new_store();
        put(&store, "Acme", "H1", "m1").await;
        put(&store, "Globex", "H1", "retired-model").await;
        put(&store, "Initech", "H0", "m1").await;
        let corrupt = put(&store, "Umbrella", "H1", "m1").await;
        store.flag_corrupt(corrupt).await.unwrap();

        let manager = EvictionManager::new(store.clone(), settings(100, &["retired-model"]));
        let report = manager.sweep(Some("H1")).await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                corrupt: 1,
                retired: 1,
                stale: 1,
                evicted: 0
            }
        );
        assert_eq!(report.total(), 3);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_without_profile_keeps_other_profiles() {
        let store = new_store();
        put(&store, "Acme", "H1", "m1").await;
        put(&store, "Globex", "H0", "m1").await;

        let manager = EvictionManager::new(store.clone(), settings(100, &[]));
        let report = manager.sweep(None).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_trims_to_capacity() {
        let store = new_store();
        put(&store, "Acme", "H1", "m1").await;
        put(&store, "Globex", "H1", "m1").await;
        put(&store, "Initech", "H1", "m1").await;

        let manager = Arc::new(EvictionManager::new(store.clone(), settings(1, &[])));
        let handle = manager.spawn_periodic(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.count().await.unwrap(), 1);
        handle.abort();
    }
}
