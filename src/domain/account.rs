use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    TokenExpired,
    RateLimited,
    Suspended,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyProtocol {
    Http,
    Https,
}

/// A fleet-managed identity on the Platform.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub x_user_id: String,
    pub username: String,
    pub display_name: String,
    pub language: Option<String>,
    pub purpose: Option<String>,

    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,

    pub status: AccountStatus,
    pub health_message: Option<String>,

    pub min_interval_minutes: i32,
    pub daily_post_limit: i32,
    pub monthly_post_limit: i32,
    pub last_posted_at: Option<DateTime<Utc>>,

    pub proxy_enabled: bool,
    pub proxy_protocol: Option<ProxyProtocol>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<i32>,
    pub proxy_username: Option<String>,
    pub proxy_password_enc: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// `(proxyEnabled ⇒ protocol/host/port present) ∧ (¬proxyEnabled ⇒ all proxy fields null)`.
    pub fn proxy_config_is_consistent(&self) -> bool {
        if self.proxy_enabled {
            self.proxy_protocol.is_some() && self.proxy_host.is_some() && self.proxy_port.is_some()
        } else {
            self.proxy_protocol.is_none()
                && self.proxy_host.is_none()
                && self.proxy_port.is_none()
                && self.proxy_username.is_none()
                && self.proxy_password_enc.is_none()
        }
    }
}
