use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per POSTED schedule, zero-initialized. Populated later by an out-of-scope collector.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostMetric {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub impressions: i64,
    pub likes: i64,
    pub reposts: i64,
    pub replies: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
