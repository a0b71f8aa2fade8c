use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Success,
    Fail,
    Blocked,
    RetryScheduled,
}

/// Append-only audit row: one per terminal or non-terminal attempt outcome.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PublishAttempt {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub account_id: Uuid,
    pub attempt_no: i32,
    pub status: AttemptStatus,
    pub requested_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub http_status: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub rate_limit_limit: Option<i32>,
    pub rate_limit_remaining: Option<i32>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
}
