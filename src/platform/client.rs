//! Publish + OAuth2 refresh against the Platform.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use reqwest::StatusCode;
use tracing::warn;

use crate::domain::rate_limit::RateLimitInfo;
use crate::platform::error::{PlatformError, PlatformOutcome, RefreshOutcome};
use crate::platform::proxy::{self, ProxySpec};
use crate::platform::types::{CreatePostRequest, CreatePostResponse, PlatformErrorBody, TokenRefreshResponse};

const TWEETS_URL: &str = "https://api.x.com/2/tweets";
const OAUTH_TOKEN_URL: &str = "https://api.x.com/2/oauth2/token";

pub struct PlatformClient {
    client: Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    mock: bool,
    tweets_url: String,
    oauth_token_url: String,
}

impl PlatformClient {
    pub fn new(client_id: Option<String>, client_secret: Option<String>, mock: bool) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("failed to build the default Platform HTTP client"),
            client_id,
            client_secret,
            mock,
            tweets_url: TWEETS_URL.to_string(),
            oauth_token_url: OAUTH_TOKEN_URL.to_string(),
        }
    }

    /// Points both Platform endpoints at a different base (a `wiremock::MockServer` URI in
    /// tests).
    pub fn with_base_url(
        client_id: Option<String>,
        client_secret: Option<String>,
        mock: bool,
        base_url: &str,
    ) -> Self {
        let mut client = Self::new(client_id, client_secret, mock);
        client.tweets_url = format!("{base_url}/2/tweets");
        client.oauth_token_url = format!("{base_url}/2/oauth2/token");
        client
    }

    fn client_for_proxy(&self, proxy_spec: Option<&ProxySpec>) -> Result<Client, PlatformError> {
        match proxy_spec {
            Some(spec) => proxy::client_for(spec),
            None => Ok(self.client.clone()),
        }
    }

    pub async fn publish(
        &self,
        access_token: &str,
        text: &str,
        proxy_spec: Option<&ProxySpec>,
    ) -> Result<PlatformOutcome, PlatformError> {
        if self.mock {
            return Ok(PlatformOutcome::Success {
                post_id: format!("mock-{}", uuid::Uuid::new_v4()),
                rate_limit: RateLimitInfo::default(),
            });
        }

        let client = self.client_for_proxy(proxy_spec)?;
        let response = client
            .post(&self.tweets_url)
            .bearer_auth(access_token)
            .json(&CreatePostRequest { text })
            .send()
            .await?;

        let status = response.status();
        let rate_limit = parse_rate_limit(response.headers());

        if status.is_success() {
            let body: CreatePostResponse = response.json().await.unwrap_or_default();
            match body.data {
                Some(data) => Ok(PlatformOutcome::Success { post_id: data.id, rate_limit }),
                None => Ok(PlatformOutcome::Failure {
                    http_status: status.as_u16(),
                    error_code: None,
                    error_message: Some(format!("x_publish_failed_{}", status.as_u16())),
                    rate_limit,
                }),
            }
        } else {
            let (error_code, error_message) = parse_error_body(response, status).await;
            Ok(PlatformOutcome::Failure {
                http_status: status.as_u16(),
                error_code,
                error_message,
                rate_limit,
            })
        }
    }

    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        proxy_spec: Option<&ProxySpec>,
    ) -> Result<RefreshOutcome, PlatformError> {
        if self.mock {
            return Ok(RefreshOutcome::Success {
                access_token: format!("mock-access-{}", uuid::Uuid::new_v4()),
                refresh_token: Some(refresh_token.to_string()),
                expires_at: Utc::now() + chrono::Duration::seconds(7200),
                rate_limit: RateLimitInfo::default(),
            });
        }

        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Ok(RefreshOutcome::Failure {
                http_status: 500,
                error_message: "OAuth client credentials are missing".to_string(),
                rate_limit: RateLimitInfo::default(),
            });
        };

        let client = self.client_for_proxy(proxy_spec)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id.as_str()),
        ];

        let response = client
            .post(&self.oauth_token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let rate_limit = parse_rate_limit(response.headers());

        if !status.is_success() {
            let (_, message) = parse_error_body(response, status).await;
            return Ok(RefreshOutcome::Failure {
                http_status: status.as_u16(),
                error_message: message.unwrap_or_else(|| format!("x_refresh_failed_{}", status.as_u16())),
                rate_limit,
            });
        }

        let body: TokenRefreshResponse = response.json().await.unwrap_or_default();
        match body.access_token {
            Some(access_token) => {
                let expires_in = body.expires_in.unwrap_or(0).max(1);
                Ok(RefreshOutcome::Success {
                    access_token,
                    refresh_token: body.refresh_token,
                    expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
                    rate_limit,
                })
            }
            None => Ok(RefreshOutcome::Failure {
                http_status: status.as_u16(),
                error_message: "refresh response was missing access_token".to_string(),
                rate_limit,
            }),
        }
    }
}

async fn parse_error_body(
    response: reqwest::Response,
    status: StatusCode,
) -> (Option<String>, Option<String>) {
    match response.json::<PlatformErrorBody>().await {
        Ok(body) => (body.error.clone(), body.best_message()),
        Err(e) => {
            warn!("Platform returned a non-JSON or unexpected error body: {e}");
            (None, Some(format!("x_publish_failed_{}", status.as_u16())))
        }
    }
}

fn parse_rate_limit(headers: &reqwest::header::HeaderMap) -> RateLimitInfo {
    let limit = header_i32(headers, "x-rate-limit-limit");
    let remaining = header_i32(headers, "x-rate-limit-remaining");
    let reset_at = header_i64(headers, "x-rate-limit-reset").and_then(epoch_seconds_to_instant);
    RateLimitInfo { limit, remaining, reset_at }
}

fn header_i32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_i64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn epoch_seconds_to_instant(epoch_secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch_secs, 0).single()
}
