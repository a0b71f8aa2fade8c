use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentStatus {
    Draft,
    Approved,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Content {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub topic: Option<String>,
    pub language: Option<String>,
    pub status: ContentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-(content, account) materialized text actually published.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentVariant {
    pub id: Uuid,
    pub content_id: Uuid,
    pub account_id: Option<Uuid>,
    pub body: String,
    /// First 24 hex chars of SHA-256 over the risk-normalized body. Lookup hint only.
    pub similarity_key: String,
    pub created_at: DateTime<Utc>,
}
