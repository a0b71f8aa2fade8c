//! The scheduler/dispatcher that selects due work, enforces the risk envelope, refreshes
//! OAuth tokens, calls the Platform, and atomically settles results.
//! This is the heart of the system: `run_cycle` is `RunCycle(limit)`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crypto::CredentialStore;
use crate::domain::{Account, ActivityLevel, AttemptStatus, Schedule, ScheduleStatus};
use crate::platform::{PlatformClient, PlatformOutcome, ProxySpec, RefreshOutcome};
use crate::risk::{self, RiskOutcome};

const MAX_LIMIT: i64 = 200;
const MIN_LIMIT: i64 = 1;
const CORPUS_CAP: usize = 250;
const CORPUS_WINDOW_HOURS: i64 = 72;
const BACKOFF_MINUTES: [i64; 3] = [2, 10, 30];

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CycleSummary {
    pub scanned: usize,
    pub attempted: usize,
    pub posted: usize,
    pub failed: usize,
    pub blocked: usize,
    pub rescheduled: usize,
}

/// Drains up to `limit` due schedules. `limit` is clamped to `[1, 200]`.
pub async fn run_cycle(
    pool: &PgPool,
    credential_store: &CredentialStore,
    platform_client: &PlatformClient,
    timezone: Tz,
    limit: i64,
) -> Result<CycleSummary, sqlx::Error> {
    let limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);
    let now = Utc::now();

    let due = select_due_schedules(pool, limit).await?;
    let mut summary = CycleSummary {
        scanned: due.len(),
        ..Default::default()
    };

    let mut seen_accounts: HashSet<Uuid> = HashSet::new();
    let mut corpus = preload_recent_corpus(pool, now).await?;

    for schedule in due {
        if !seen_accounts.insert(schedule.account_id) {
            continue;
        }
        summary.attempted += 1;

        let account: Account = sqlx::query_as("SELECT * FROM accounts WHERE id = $1")
            .bind(schedule.account_id)
            .fetch_one(pool)
            .await?;
        let variant_body: String =
            sqlx::query_scalar("SELECT body FROM content_variants WHERE id = $1")
                .bind(schedule.content_variant_id)
                .fetch_one(pool)
                .await?;

        let outcome = process_schedule(
            pool,
            credential_store,
            platform_client,
            timezone,
            &schedule,
            &account,
            &variant_body,
            &corpus,
            now,
        )
        .await?;

        match outcome {
            ScheduleOutcome::Posted => {
                summary.posted += 1;
                corpus.insert(0, variant_body);
                corpus.truncate(CORPUS_CAP);
            }
            ScheduleOutcome::Failed => summary.failed += 1,
            ScheduleOutcome::Blocked => summary.blocked += 1,
            ScheduleOutcome::Rescheduled => summary.rescheduled += 1,
        }
    }

    Ok(summary)
}

enum ScheduleOutcome {
    Posted,
    Failed,
    Blocked,
    Rescheduled,
}

// Does not take row locks against overlapping cycles; relies on the cron trigger running at
// most one cycle at a time plus the idempotency unique index on `schedules` as a backstop.
// A `FOR UPDATE SKIP LOCKED` clause would be the fix if concurrent cycles become a real
// deployment shape.
async fn select_due_schedules(pool: &PgPool, limit: i64) -> Result<Vec<Schedule>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT * FROM schedules
        WHERE (status = $1 AND planned_at <= now())
           OR (status = $2 AND next_attempt_at <= now())
        ORDER BY priority ASC, planned_at ASC
        LIMIT $3
        "#,
    )
    .bind(ScheduleStatus::Pending)
    .bind(ScheduleStatus::Failed)
    .bind(limit)
    .fetch_all(pool)
    .await
}

async fn preload_recent_corpus(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<String>, sqlx::Error> {
    let since = now - chrono::Duration::hours(CORPUS_WINDOW_HOURS);
    sqlx::query_scalar(
        r#"
        SELECT cv.body
        FROM schedules s
        JOIN content_variants cv ON cv.id = s.content_variant_id
        WHERE s.status = $1 AND s.posted_at >= $2
        ORDER BY s.posted_at DESC
        LIMIT $3
        "#,
    )
    .bind(ScheduleStatus::Posted)
    .bind(since)
    .bind(CORPUS_CAP as i64)
    .fetch_all(pool)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn process_schedule(
    pool: &PgPool,
    credential_store: &CredentialStore,
    platform_client: &PlatformClient,
    timezone: Tz,
    schedule: &Schedule,
    account: &Account,
    variant_body: &str,
    corpus: &[String],
    now: DateTime<Utc>,
) -> Result<ScheduleOutcome, sqlx::Error> {
    // 1. Proxy resolve.
    let proxy_spec = match resolve_proxy(credential_store, account) {
        ProxyResolution::None => None,
        ProxyResolution::Some(spec) => Some(spec),
        ProxyResolution::Blocked(reason) => {
            settle_blocked(pool, schedule, account.id, &reason, None, now).await?;
            return Ok(ScheduleOutcome::Blocked);
        }
    };

    // 2. Token availability.
    let access_token = match ensure_access_token(
        pool,
        credential_store,
        platform_client,
        account,
        proxy_spec.as_ref(),
        now,
    )
    .await?
    {
        TokenResolution::Token(token) => token,
        TokenResolution::Blocked(reason) => {
            settle_blocked(
                pool,
                schedule,
                account.id,
                &reason,
                Some(crate::domain::AccountStatus::TokenExpired),
                now,
            )
            .await?;
            return Ok(ScheduleOutcome::Blocked);
        }
        TokenResolution::BlockedNoAccountChange(reason) => {
            settle_blocked(pool, schedule, account.id, &reason, None, now).await?;
            return Ok(ScheduleOutcome::Blocked);
        }
    };

    // 3. Risk gate.
    match risk::evaluate(pool, account, variant_body, corpus, now, timezone).await? {
        RiskOutcome::Proceed => {}
        RiskOutcome::Rescheduled { planned_at, reason } => {
            settle_rescheduled(pool, schedule, planned_at, &reason).await?;
            return Ok(ScheduleOutcome::Rescheduled);
        }
        RiskOutcome::Blocked { reason } => {
            settle_blocked(pool, schedule, account.id, &reason, None, now).await?;
            return Ok(ScheduleOutcome::Blocked);
        }
    }

    // 4/5. Publish and settle.
    match platform_client
        .publish(&access_token, variant_body, proxy_spec.as_ref())
        .await
    {
        Ok(PlatformOutcome::Success { post_id, rate_limit }) => {
            settle_success(pool, schedule, account.id, &post_id, rate_limit, now).await?;
            Ok(ScheduleOutcome::Posted)
        }
        Ok(PlatformOutcome::Failure {
            http_status,
            error_code,
            error_message,
            rate_limit,
        }) => {
            let blocked = settle_failure(
                pool,
                schedule,
                account,
                http_status,
                error_code,
                error_message,
                rate_limit,
                now,
            )
            .await?;
            Ok(if blocked {
                ScheduleOutcome::Blocked
            } else {
                ScheduleOutcome::Failed
            })
        }
        Err(e) => {
            // Transport-level failure (network error): treated as a retryable platform failure
            // with no rate-limit metadata; treated as a retryable platform failure.
            let blocked = settle_failure(
                pool,
                schedule,
                account,
                0,
                None,
                Some(e.to_string()),
                Default::default(),
                now,
            )
            .await?;
            Ok(if blocked {
                ScheduleOutcome::Blocked
            } else {
                ScheduleOutcome::Failed
            })
        }
    }
}

enum ProxyResolution {
    None,
    Some(ProxySpec),
    Blocked(String),
}

fn resolve_proxy(credential_store: &CredentialStore, account: &Account) -> ProxyResolution {
    if !account.proxy_enabled {
        return ProxyResolution::None;
    }

    let (Some(protocol), Some(host), Some(port)) =
        (account.proxy_protocol, account.proxy_host.as_deref(), account.proxy_port)
    else {
        return ProxyResolution::Blocked(
            "Proxy is enabled but protocol, host, or port is missing.".to_string(),
        );
    };

    let password = match &account.proxy_password_enc {
        Some(enc) => match credential_store.open(enc) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                return ProxyResolution::Blocked(
                    "Failed to decrypt the account's proxy password.".to_string(),
                )
            }
        },
        None => None,
    };

    ProxyResolution::Some(ProxySpec {
        protocol,
        host: host.to_string(),
        port: port as u16,
        username: account.proxy_username.clone(),
        password,
    })
}

enum TokenResolution {
    Token(String),
    /// Demotes the account to TOKEN_EXPIRED.
    Blocked(String),
    /// Blocks the schedule without changing account status.
    BlockedNoAccountChange(String),
}

async fn ensure_access_token(
    pool: &PgPool,
    credential_store: &CredentialStore,
    platform_client: &PlatformClient,
    account: &Account,
    proxy_spec: Option<&ProxySpec>,
    now: DateTime<Utc>,
) -> Result<TokenResolution, sqlx::Error> {
    let needs_refresh = account.token_expires_at.is_some_and(|exp| exp <= now);

    if !needs_refresh {
        return Ok(match credential_store.open(&account.access_token_enc) {
            Ok(token) => TokenResolution::Token(token),
            Err(_) => TokenResolution::BlockedNoAccountChange(
                "Failed to decrypt the account's access token.".to_string(),
            ),
        });
    }

    let Some(refresh_token_enc) = &account.refresh_token_enc else {
        return Ok(TokenResolution::Blocked(
            "Access token expired and no refresh token is on file.".to_string(),
        ));
    };

    let refresh_token = match credential_store.open(refresh_token_enc) {
        Ok(token) => token,
        Err(_) => {
            return Ok(TokenResolution::Blocked(
                "Access token expired and the refresh token failed to decrypt.".to_string(),
            ))
        }
    };

    match platform_client.refresh_token(&refresh_token, proxy_spec).await {
        Ok(RefreshOutcome::Success {
            access_token,
            refresh_token,
            expires_at,
            ..
        }) => {
            settle_token_refresh(
                pool,
                credential_store,
                account.id,
                &access_token,
                refresh_token.as_deref(),
                expires_at,
            )
            .await?;
            Ok(TokenResolution::Token(access_token))
        }
        Ok(RefreshOutcome::Failure { error_message, .. }) => {
            Ok(TokenResolution::Blocked(error_message))
        }
        Err(e) => Ok(TokenResolution::Blocked(format!(
            "Unexpected error refreshing the access token: {e}"
        ))),
    }
}

async fn settle_token_refresh(
    pool: &PgPool,
    credential_store: &CredentialStore,
    account_id: Uuid,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let access_token_enc = credential_store.seal(access_token);
    let refresh_token_enc = refresh_token.map(|t| credential_store.seal(t));

    sqlx::query(
        r#"
        UPDATE accounts
        SET access_token_enc = $1,
            refresh_token_enc = COALESCE($2, refresh_token_enc),
            token_expires_at = $3,
            status = $4,
            health_message = NULL,
            updated_at = now()
        WHERE id = $5
        "#,
    )
    .bind(access_token_enc)
    .bind(refresh_token_enc)
    .bind(expires_at)
    .bind(crate::domain::AccountStatus::Active)
    .bind(account_id)
    .execute(pool)
    .await?;

    Ok(())
}

async fn next_attempt_no(pool: &PgPool, schedule_id: Uuid) -> Result<i32, sqlx::Error> {
    let attempt_count: i32 =
        sqlx::query_scalar("SELECT attempt_count FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_one(pool)
            .await?;
    Ok(attempt_count + 1)
}

async fn settle_success(
    pool: &PgPool,
    schedule: &Schedule,
    account_id: Uuid,
    post_id: &str,
    rate_limit: crate::domain::rate_limit::RateLimitInfo,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let attempt_no = next_attempt_no(pool, schedule.id).await?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE schedules
        SET status = $1, posted_at = $2, external_post_id = $3, attempt_count = $4,
            last_error = NULL, next_attempt_at = NULL, updated_at = $2
        WHERE id = $5
        "#,
    )
    .bind(ScheduleStatus::Posted)
    .bind(now)
    .bind(post_id)
    .bind(attempt_no)
    .bind(schedule.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE accounts SET status = $1, health_message = NULL, last_posted_at = $2, updated_at = $2 WHERE id = $3",
    )
    .bind(crate::domain::AccountStatus::Active)
    .bind(now)
    .bind(account_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO publish_attempts
            (id, schedule_id, account_id, attempt_no, status, requested_at, finished_at,
             http_status, rate_limit_limit, rate_limit_remaining, rate_limit_reset_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6, 200, $7, $8, $9)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(schedule.id)
    .bind(account_id)
    .bind(attempt_no)
    .bind(AttemptStatus::Success)
    .bind(now)
    .bind(rate_limit.limit)
    .bind(rate_limit.remaining)
    .bind(rate_limit.reset_at)
    .execute(&mut *tx)
    .await?;

    insert_rate_limit_snapshot(&mut tx, account_id, rate_limit, now).await?;

    sqlx::query(
        "INSERT INTO post_metrics (id, schedule_id, impressions, likes, reposts, replies) \
         VALUES ($1, $2, 0, 0, 0, 0)",
    )
    .bind(Uuid::new_v4())
    .bind(schedule.id)
    .execute(&mut *tx)
    .await?;

    log_activity(
        &mut tx,
        ActivityLevel::Info,
        "schedule_posted",
        &format!("Schedule {} posted as {post_id}.", schedule.id),
        Some(account_id),
        Some(schedule.id),
    )
    .await?;

    tx.commit().await
}

/// Returns `true` if the schedule ended up BLOCKED (terminal), `false` if FAILED (will retry).
async fn settle_failure(
    pool: &PgPool,
    schedule: &Schedule,
    account: &Account,
    http_status: u16,
    error_code: Option<String>,
    error_message: Option<String>,
    rate_limit: crate::domain::rate_limit::RateLimitInfo,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let attempt_no = next_attempt_no(pool, schedule.id).await?;
    let force_block = matches!(http_status, 401 | 403);
    let can_retry = !force_block && attempt_no < schedule.max_attempts;

    let next_status = if can_retry {
        ScheduleStatus::Failed
    } else {
        ScheduleStatus::Blocked
    };
    let next_account_status = match http_status {
        429 => Some(crate::domain::AccountStatus::RateLimited),
        401 => Some(crate::domain::AccountStatus::TokenExpired),
        403 => Some(crate::domain::AccountStatus::Suspended),
        _ => None,
    };
    let next_attempt_at = if can_retry {
        Some(retry_at(now, attempt_no, rate_limit.reset_at))
    } else {
        None
    };

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE schedules
        SET status = $1, attempt_count = $2, last_error = $3, next_attempt_at = $4, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(next_status)
    .bind(attempt_no)
    .bind(&error_message)
    .bind(next_attempt_at)
    .bind(now)
    .bind(schedule.id)
    .execute(&mut *tx)
    .await?;

    if let Some(status) = next_account_status {
        sqlx::query(
            "UPDATE accounts SET status = $1, health_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status)
        .bind(&error_message)
        .bind(now)
        .bind(account.id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO publish_attempts
            (id, schedule_id, account_id, attempt_no, status, requested_at, finished_at,
             http_status, error_code, error_message, rate_limit_limit, rate_limit_remaining, rate_limit_reset_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(schedule.id)
    .bind(account.id)
    .bind(attempt_no)
    .bind(AttemptStatus::Fail)
    .bind(now)
    .bind(http_status as i32)
    .bind(&error_code)
    .bind(&error_message)
    .bind(rate_limit.limit)
    .bind(rate_limit.remaining)
    .bind(rate_limit.reset_at)
    .execute(&mut *tx)
    .await?;

    insert_rate_limit_snapshot(&mut tx, account.id, rate_limit, now).await?;

    let message = error_message.unwrap_or_else(|| format!("publish failed with status {http_status}"));
    if can_retry {
        warn!(schedule_id = %schedule.id, %http_status, "schedule publish failed, retry scheduled");
        log_activity(&mut tx, ActivityLevel::Warn, "schedule_retry_scheduled", &message, Some(account.id), Some(schedule.id)).await?;
    } else {
        error!(schedule_id = %schedule.id, %http_status, "schedule publish failed, blocked");
        log_activity(&mut tx, ActivityLevel::Error, "schedule_blocked", &message, Some(account.id), Some(schedule.id)).await?;
    }

    tx.commit().await?;
    Ok(!can_retry)
}

async fn settle_blocked(
    pool: &PgPool,
    schedule: &Schedule,
    account_id: Uuid,
    reason: &str,
    account_status: Option<crate::domain::AccountStatus>,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let attempt_no = next_attempt_no(pool, schedule.id).await?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE schedules SET status = $1, last_error = $2, next_attempt_at = NULL, updated_at = $3 WHERE id = $4",
    )
    .bind(ScheduleStatus::Blocked)
    .bind(reason)
    .bind(now)
    .bind(schedule.id)
    .execute(&mut *tx)
    .await?;

    if let Some(status) = account_status {
        sqlx::query(
            "UPDATE accounts SET status = $1, health_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status)
        .bind(reason)
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO publish_attempts
            (id, schedule_id, account_id, attempt_no, status, requested_at, finished_at, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(schedule.id)
    .bind(account_id)
    .bind(attempt_no)
    .bind(AttemptStatus::Blocked)
    .bind(now)
    .bind(reason)
    .execute(&mut *tx)
    .await?;

    error!(schedule_id = %schedule.id, reason, "schedule blocked");
    log_activity(&mut tx, ActivityLevel::Error, "schedule_blocked", reason, Some(account_id), Some(schedule.id)).await?;

    tx.commit().await
}

async fn settle_rescheduled(
    pool: &PgPool,
    schedule: &Schedule,
    planned_at: DateTime<Utc>,
    reason: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE schedules SET status = $1, planned_at = $2, next_attempt_at = NULL, last_error = $3, updated_at = now() WHERE id = $4",
    )
    .bind(ScheduleStatus::Pending)
    .bind(planned_at)
    .bind(reason)
    .bind(schedule.id)
    .execute(&mut *tx)
    .await?;

    info!(schedule_id = %schedule.id, %planned_at, "schedule rescheduled for pacing");
    log_activity(&mut tx, ActivityLevel::Info, "schedule_rescheduled", reason, Some(schedule.account_id), Some(schedule.id)).await?;

    tx.commit().await
}

async fn insert_rate_limit_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
    rate_limit: crate::domain::rate_limit::RateLimitInfo,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_snapshots (id, account_id, endpoint, limit_value, remaining, reset_at, observed_at)
        VALUES ($1, $2, 'POST /2/tweets', $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(rate_limit.limit)
    .bind(rate_limit.remaining)
    .bind(rate_limit.reset_at)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn log_activity(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    level: ActivityLevel,
    event: &str,
    message: &str,
    account_id: Option<Uuid>,
    schedule_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO activity_log (id, level, event, message, meta, account_id, schedule_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(level)
    .bind(event)
    .bind(message)
    .bind(json!(null))
    .bind(account_id)
    .bind(schedule_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// `max(now + backoff[clamp(n-1, 0, 2)], resetAt)` — the Platform's advertised reset always
/// wins when it is later than the back-off floor.
fn retry_at(now: DateTime<Utc>, attempt_no: i32, reset_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let index = (attempt_no - 1).clamp(0, 2) as usize;
    let floor = now + chrono::Duration::minutes(BACKOFF_MINUTES[index]);
    match reset_at {
        Some(reset) if reset > floor => reset,
        _ => floor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_at_uses_backoff_floor_when_reset_is_earlier() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let reset = now + chrono::Duration::seconds(30);
        let at = retry_at(now, 1, Some(reset));
        assert_eq!(at, now + chrono::Duration::minutes(2));
    }

    #[test]
    fn retry_at_uses_reset_when_it_is_later_than_the_backoff_floor() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let reset = now + chrono::Duration::minutes(5);
        let at = retry_at(now, 1, Some(reset));
        assert_eq!(at, reset);
    }

    #[test]
    fn retry_at_clamps_attempt_number_to_the_last_backoff_tier() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let at_5 = retry_at(now, 5, None);
        let at_3 = retry_at(now, 3, None);
        assert_eq!(at_5, at_3);
        assert_eq!(at_5, now + chrono::Duration::minutes(30));
    }
}
