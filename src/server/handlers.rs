use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::cycle::{self, CycleSummary};
use crate::error::AppError;
use crate::server::AppState;

const DEFAULT_LIMIT: i64 = 30;

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize, Default)]
pub struct PublishCronRequest {
    pub limit: Option<i64>,
}

/// `POST /cron/publish` — the one trigger surface for `RunCycle`. `{limit}` is optional
/// (default 30) and clamped to `[1,200]` by `run_cycle`; an ill-typed `limit` is the only
/// thing that yields 400 here.
pub async fn publish_cron(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CycleSummary>, AppError> {
    authorize(&state, &headers)?;

    let requested_limit = if body.is_empty() {
        DEFAULT_LIMIT
    } else {
        let request: PublishCronRequest = serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("malformed request body: {e}")))?;
        request.limit.unwrap_or(DEFAULT_LIMIT)
    };

    let summary = cycle::run_cycle(
        &state.pool,
        &state.credential_store,
        &state.platform_client,
        state.config.publisher_timezone,
        requested_limit,
    )
    .await
    .map_err(anyhow::Error::from)?;

    info!(?summary, "publish cycle completed");
    Ok(Json(summary))
}

/// A configured `CRON_SECRET` must match either `X-Cron-Secret` or the bearer token in
/// `Authorization`. If no secret is configured, the endpoint is open.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &state.config.cron_secret else {
        return Ok(());
    };

    let header_secret = headers
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bearer_secret = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    if header_secret.as_deref() == Some(expected.as_str())
        || bearer_secret.as_deref() == Some(expected.as_str())
    {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}
