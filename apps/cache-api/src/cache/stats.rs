//! Hit/miss counters for cache-effectiveness reporting.
//!
//! Counters are process-local atomics. When Redis is configured each increment
//! is also mirrored into a Redis hash so counts survive restarts and can be
//! aggregated across instances; mirror failures are logged and dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::warn;

use crate::cache::types::{DocumentType, LookupTier};

const REDIS_STATS_KEY: &str = "doc_cache:stats";

const DOC_TYPES: usize = DocumentType::ALL.len();
const TIERS: usize = LookupTier::ALL.len();

fn doc_index(document_type: DocumentType) -> usize {
    match document_type {
        DocumentType::Resume => 0,
        DocumentType::CoverLetter => 1,
        DocumentType::CoverLetterBody => 2,
    }
}

fn tier_index(tier: LookupTier) -> usize {
    match tier {
        LookupTier::Exact => 0,
        LookupTier::Role => 1,
        LookupTier::Archetype => 2,
        LookupTier::Semantic => 3,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentTypeStats {
    pub document_type: DocumentType,
    pub entry_count: u64,
    pub misses: u64,
    pub hits: BTreeMap<LookupTier, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsReport {
    pub total_entries: u64,
    pub document_types: Vec<DocumentTypeStats>,
}

pub struct CacheStatsRecorder {
    hits: [[AtomicU64; TIERS]; DOC_TYPES],
    misses: [AtomicU64; DOC_TYPES],
    redis: Option<MultiplexedConnection>,
}

impl CacheStatsRecorder {
    pub fn new(redis: Option<MultiplexedConnection>) -> Self {
        Self {
            hits: Default::default(),
            misses: Default::default(),
            redis,
        }
    }

    pub fn record_hit(&self, document_type: DocumentType, tier: LookupTier) {
        self.hits[doc_index(document_type)][tier_index(tier)].fetch_add(1, Ordering::Relaxed);
        self.mirror(format!("{document_type}:hit:{tier}"));
    }

    pub fn record_miss(&self, document_type: DocumentType) {
        self.misses[doc_index(document_type)].fetch_add(1, Ordering::Relaxed);
        self.mirror(format!("{document_type}:miss"));
    }

    pub fn hits(&self, document_type: DocumentType, tier: LookupTier) -> u64 {
        self.hits[doc_index(document_type)][tier_index(tier)].load(Ordering::Relaxed)
    }

    pub fn misses(&self, document_type: DocumentType) -> u64 {
        self.misses[doc_index(document_type)].load(Ordering::Relaxed)
    }

    /// Combines counters with current entry counts per document type.
    pub fn report(&self, entry_counts: &BTreeMap<DocumentType, u64>) -> CacheStatsReport {
        let document_types = DocumentType::ALL
            .iter()
            .map(|&document_type| DocumentTypeStats {
                document_type,
                entry_count: entry_counts.get(&document_type).copied().unwrap_or(0),
                misses: self.misses(document_type),
                hits: LookupTier::ALL
                    .iter()
                    .map(|&tier| (tier, self.hits(document_type, tier)))
                    .collect(),
            })
            .collect();

        CacheStatsReport {
            total_entries: entry_counts.values().sum(),
            document_types,
        }
    }

    /// Fire-and-forget `HINCRBY` into the shared stats hash.
    fn mirror(&self, field: String) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let result: redis::RedisResult<i64> = conn.hincr(REDIS_STATS_KEY, &field, 1).await;
            if let Err(e) = result {
                warn!("Failed to mirror cache stat {field} to Redis: {e}");
            }
        });
    }
}
