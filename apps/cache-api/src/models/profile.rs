use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// The content-bearing columns of the latest version of a profile entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProfileContentItem {
    pub entry_id: Uuid,
    pub entry_type: String,
    pub tags: Vec<String>,
    pub data: Value,
}
