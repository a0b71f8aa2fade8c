use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::rate_limit::RateLimitInfo;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("proxy configuration is invalid: {0}")]
    InvalidProxy(String),
}

/// Tagged variant `Success{postId?} | Failure{code?, message?}`, tolerant of whichever shape
/// the Platform actually returns on a given failure.
#[derive(Debug, Clone)]
pub enum PlatformOutcome {
    Success {
        post_id: String,
        rate_limit: RateLimitInfo,
    },
    Failure {
        http_status: u16,
        error_code: Option<String>,
        error_message: Option<String>,
        rate_limit: RateLimitInfo,
    },
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Success {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        rate_limit: RateLimitInfo,
    },
    Failure {
        http_status: u16,
        error_message: String,
        rate_limit: RateLimitInfo,
    },
}
