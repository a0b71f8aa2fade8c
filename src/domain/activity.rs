use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub level: ActivityLevel,
    pub event: String,
    pub message: String,
    pub meta: Option<serde_json::Value>,
    pub account_id: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
