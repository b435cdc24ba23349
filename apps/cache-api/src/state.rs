use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::eviction::EvictionManager;
use crate::cache::fingerprint::FingerprintComputer;
use crate::cache::lookup::TierLookupEngine;
use crate::cache::stats::CacheStatsRecorder;
use crate::cache::store::CacheStore;
use crate::config::CacheSettings;
use crate::embeddings::EmbeddingAdapter;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TierLookupEngine>,
    pub eviction: Arc<EvictionManager>,
    pub store: Arc<dyn CacheStore>,
    pub stats: Arc<CacheStatsRecorder>,
    /// Present on the Postgres backend; profile hashing reads `context_entries` from it.
    pub db: Option<PgPool>,
}

impl AppState {
    /// Wires the engine and eviction manager around one store.
    pub fn new(
        store: Arc<dyn CacheStore>,
        fingerprints: FingerprintComputer,
        embeddings: Option<EmbeddingAdapter>,
        stats: Arc<CacheStatsRecorder>,
        settings: CacheSettings,
        db: Option<PgPool>,
    ) -> Self {
        let engine = TierLookupEngine::new(
            Arc::clone(&store),
            fingerprints,
            embeddings,
            Arc::clone(&stats),
            settings.clone(),
        );
        let eviction = EvictionManager::new(Arc::clone(&store), settings);
        Self {
            engine: Arc::new(engine),
            eviction: Arc::new(eviction),
            store,
            stats,
            db,
        }
    }
}
