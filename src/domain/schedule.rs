use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleStatus {
    Pending,
    Processing,
    Posted,
    Failed,
    Blocked,
    Canceled,
}

/// The unit of work: one planned post for one account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub account_id: Uuid,
    pub content_id: Uuid,
    pub content_variant_id: Uuid,
    pub planned_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub idempotency_key: String,
    pub priority: i32,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub external_post_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn default_idempotency_key(content_id: Uuid, account_id: Uuid, planned_at: DateTime<Utc>) -> String {
        format!("{content_id}:{account_id}:{}", planned_at.to_rfc3339())
    }
}
