use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parsed from Platform response headers. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitSnapshot {
    pub id: Uuid,
    pub account_id: Uuid,
    pub endpoint: String,
    #[sqlx(rename = "limit_value")]
    pub limit: Option<i32>,
    pub remaining: Option<i32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// Rate-limit metadata lifted from a Platform response, common to Publish and RefreshToken.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<i32>,
    pub remaining: Option<i32>,
    pub reset_at: Option<DateTime<Utc>>,
}
