use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::eviction::SweepReport;
use crate::cache::lookup::StoreOutcome;
use crate::cache::staleness::{load_current_items, ContentStalenessTracker};
use crate::cache::stats::CacheStatsReport;
use crate::cache::types::{
    CacheEntry, CacheEntryDraft, CachedDocument, DocumentType, JobContext, LookupResult,
    LookupTier,
};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LookupRequest {
    pub job: JobContext,
    pub profile_content_hash: String,
    pub document_type: DocumentType,
}

/// A served entry: metadata plus the parsed document.
#[derive(Serialize)]
pub struct CachedEntryView {
    pub id: Uuid,
    pub document_type: DocumentType,
    pub model_version: String,
    pub role_normalized: String,
    pub tech_stack: Vec<String>,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub document: CachedDocument,
}

impl CachedEntryView {
    fn new(entry: CacheEntry, document: CachedDocument) -> Self {
        Self {
            id: entry.id,
            document_type: entry.document_type,
            model_version: entry.model_version,
            role_normalized: entry.role_normalized,
            tech_stack: entry.tech_stack,
            hit_count: entry.hit_count,
            last_hit_at: entry.last_hit_at,
            created_at: entry.created_at,
            document,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupResponse {
    Hit {
        tier: LookupTier,
        #[serde(skip_serializing_if = "Option::is_none")]
        similarity: Option<f32>,
        entry: CachedEntryView,
    },
    Miss,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreResponse {
    Stored {
        entry_id: Uuid,
        embedding_ref: Option<Uuid>,
    },
    AlreadyCached,
}

#[derive(Deserialize, Default)]
pub struct MaintenanceRequest {
    /// When set, entries built from any other profile are purged.
    #[serde(default)]
    pub profile_content_hash: Option<String>,
}

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct ProfileHashResponse {
    pub user_id: Uuid,
    pub profile_content_hash: String,
    pub item_count: usize,
}

fn require_non_empty(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_job(job: &JobContext) -> Result<(), AppError> {
    require_non_empty(&job.company, "job.company")?;
    require_non_empty(&job.role, "job.role")
}

/// POST /api/v1/cache/lookup
pub async fn handle_lookup(
    State(state): State<AppState>,
    Json(req): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, AppError> {
    validate_job(&req.job)?;
    require_non_empty(&req.profile_content_hash, "profile_content_hash")?;

    let response = match state
        .engine
        .lookup(&req.job, &req.profile_content_hash, req.document_type)
        .await
    {
        LookupResult::Hit {
            entry,
            document,
            tier,
            similarity,
        } => LookupResponse::Hit {
            tier,
            similarity,
            entry: CachedEntryView::new(entry, document),
        },
        LookupResult::Miss => LookupResponse::Miss,
    };
    Ok(Json(response))
}

/// POST /api/v1/cache/entries
pub async fn handle_store(
    State(state): State<AppState>,
    Json(draft): Json<CacheEntryDraft>,
) -> Result<(StatusCode, Json<StoreResponse>), AppError> {
    validate_job(&draft.job)?;
    require_non_empty(&draft.profile_content_hash, "profile_content_hash")?;
    require_non_empty(&draft.model_version, "model_version")?;

    match state.engine.store(draft).await? {
        StoreOutcome::Stored { id, embedding_ref } => Ok((
            StatusCode::CREATED,
            Json(StoreResponse::Stored {
                entry_id: id,
                embedding_ref,
            }),
        )),
        StoreOutcome::AlreadyCached => Ok((StatusCode::OK, Json(StoreResponse::AlreadyCached))),
    }
}

/// GET /api/v1/cache/stats
pub async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<CacheStatsReport>, AppError> {
    let counts = state.store.count_by_type().await?;
    Ok(Json(state.stats.report(&counts)))
}

/// POST /api/v1/cache/maintenance
pub async fn handle_maintenance(
    State(state): State<AppState>,
    body: Option<Json<MaintenanceRequest>>,
) -> Result<Json<SweepReport>, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let profile_hash = req
        .profile_content_hash
        .as_deref()
        .map(str::trim)
        .filter(|hash| !hash.is_empty());

    let report = state.eviction.sweep(profile_hash).await?;
    Ok(Json(report))
}

/// GET /api/v1/profile/content-hash
pub async fn handle_profile_hash(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<ProfileHashResponse>, AppError> {
    let Some(pool) = &state.db else {
        return Err(AppError::NotImplemented(
            "Profile content hashing requires the postgres backend".to_string(),
        ));
    };

    let items = load_current_items(pool, params.user_id).await?;
    Ok(Json(ProfileHashResponse {
        user_id: params.user_id,
        profile_content_hash: ContentStalenessTracker::compute_hash(&items),
        item_count: items.len(),
    }))
}
