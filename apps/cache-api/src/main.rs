mod cache;
mod config;
mod db;
mod embeddings;
mod errors;
mod models;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::fingerprint::{ArchetypeMap, FingerprintComputer};
use crate::cache::memory_store::InMemoryCacheStore;
use crate::cache::pg_store::PgCacheStore;
use crate::cache::similarity::{InMemorySimilarityIndex, SimilarityIndex};
use crate::cache::stats::CacheStatsRecorder;
use crate::cache::store::CacheStore;
use crate::config::{CacheBackend, Config};
use crate::db::{create_pool, run_migrations};
use crate::embeddings::openai::OpenAiEmbedder;
use crate::embeddings::EmbeddingAdapter;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing or malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting document cache API v{}", env!("CARGO_PKG_VERSION"));

    // Archetype buckets are data: a JSON file when configured, built-ins otherwise
    let archetypes = match &config.archetype_map_path {
        Some(path) => ArchetypeMap::load(path)?,
        None => {
            info!("No ARCHETYPE_MAP_PATH set; using built-in archetypes");
            ArchetypeMap::builtin()
        }
    };

    // Initialize the cache store and its similarity index
    let index: Arc<dyn SimilarityIndex> = Arc::new(InMemorySimilarityIndex::new());
    let (store, db): (Arc<dyn CacheStore>, Option<PgPool>) = match config.backend {
        CacheBackend::Postgres => {
            let database_url = config.database_url.as_deref().unwrap_or_default();
            let pool = create_pool(database_url).await?;
            run_migrations(&pool).await?;
            let store = PgCacheStore::new(pool.clone(), Arc::clone(&index));
            store.warm_index().await?;
            info!("Similarity index holds {} vectors", index.len());
            (Arc::new(store), Some(pool))
        }
        CacheBackend::Memory => {
            info!("Using in-memory cache store; entries are lost on restart");
            (Arc::new(InMemoryCacheStore::new(Arc::clone(&index))), None)
        }
    };

    // Initialize Redis stats mirror (optional)
    let redis = match &config.redis_url {
        Some(url) => match connect_redis(url).await {
            Ok(conn) => {
                info!("Redis stats mirror connected");
                Some(conn)
            }
            Err(e) => {
                warn!("Redis unavailable, cache stats stay process-local: {e}");
                None
            }
        },
        None => None,
    };
    let stats = Arc::new(CacheStatsRecorder::new(redis));

    // Initialize embedding adapter (semantic tier is disabled without one)
    let embeddings = config.embedding.as_ref().map(|embedding| {
        let embedder = OpenAiEmbedder::new(
            embedding.api_url.clone(),
            embedding.api_key.clone(),
            embedding.model.clone(),
        );
        let adapter = EmbeddingAdapter::new(Arc::new(embedder), config.embedding_dimension);
        info!(
            "Embedding client initialized (model: {}, dim: {})",
            embedding.model,
            adapter.dimension()
        );
        adapter
    });
    if embeddings.is_none() {
        info!("EMBEDDING_API_KEY not set; semantic tier disabled");
    }

    // Build app state
    let state = AppState::new(
        store,
        FingerprintComputer::new(archetypes),
        embeddings,
        stats,
        config.cache.clone(),
        db,
    );

    // Background maintenance: corrupt/retired purges and capacity eviction
    Arc::clone(&state.eviction).spawn_periodic(config.maintenance_interval);
    info!(
        "Cache maintenance every {:?} (capacity {})",
        config.maintenance_interval, config.cache.max_entries
    );

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect_redis(url: &str) -> Result<redis::aio::MultiplexedConnection> {
    let client = redis::Client::open(url)?;
    Ok(client.get_multiplexed_tokio_connection().await?)
}
