//! Content Staleness Tracker — hashes the candidate's current profile content.
//!
//! A cache entry is usable only while its `profile_content_hash` equals the hash
//! computed here. The check is applied on every lookup; sweeps reclaim space later.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::profile::ProfileContentItem;

pub struct ContentStalenessTracker;

impl ContentStalenessTracker {
    /// Deterministic hash over the ordered set of profile content items.
    ///
    /// Items are ordered by `entry_id` and tags are sorted, so neither the order
    /// rows come back from storage nor tag order affects the result. Record
    /// versions are excluded: a metadata-only revision is not a content change.
    pub fn compute_hash(items: &[ProfileContentItem]) -> String {
        let mut ordered: Vec<&ProfileContentItem> = items.iter().collect();
        ordered.sort_by_key(|item| item.entry_id);

        let mut hasher = Sha256::new();
        hasher.update((ordered.len() as u64).to_le_bytes());
        for item in ordered {
            let mut tags = item.tags.clone();
            tags.sort();
            let tags = tags.join("\u{1f}");
            // serde_json maps are key-sorted, so this is canonical.
            let data = item.data.to_string();

            hasher.update(item.entry_id.as_bytes());
            for field in [item.entry_type.as_str(), tags.as_str(), data.as_str()] {
                hasher.update((field.len() as u64).to_le_bytes());
                hasher.update(field.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// True when an entry generated from `entry_hash` may be served for `current_hash`.
    pub fn is_fresh(entry_hash: &str, current_hash: &str) -> bool {
        entry_hash == current_hash
    }
}

/// Returns the most recent version of each profile entry for a user.
pub async fn load_current_items(pool: &PgPool, user_id: Uuid) -> Result<Vec<ProfileContentItem>> {
    Ok(sqlx::query_as::<_, ProfileContentItem>(
        r#"
        SELECT DISTINCT ON (entry_id) entry_id, entry_type, tags, data
        FROM context_entries
        WHERE user_id = $1
        ORDER BY entry_id, version DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?)
}
