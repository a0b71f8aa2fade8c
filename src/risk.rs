//! Interval/quota/similarity checks run after credentials are available, before the network
//! call. Order matters: min-interval, daily quota, monthly quota, similarity.

use chrono::{DateTime, Datelike, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Account, ScheduleStatus};
use crate::similarity::{too_similar, SIMILARITY_THRESHOLD};

#[derive(Debug, Clone)]
pub enum RiskOutcome {
    Proceed,
    /// Min-interval not reached: the schedule returns to PENDING at a later `planned_at`.
    Rescheduled { planned_at: DateTime<Utc>, reason: String },
    /// Quota or similarity hit: the schedule is BLOCKED, no retry.
    Blocked { reason: String },
}

/// Resolves a naive local datetime against `tz`, picking the earlier disambiguation on a
/// fall-back overlap and the nearest valid instant after a spring-forward gap, instead of
/// panicking. Either case is a real, if rare, occurrence for day/month boundaries in
/// DST-observing `PUBLISHER_TIMEZONE` values, and the risk gate must never panic on valid input.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _latest) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..48 {
                probe += chrono::Duration::minutes(30);
                if let LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&probe)
                {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

/// Start of the account-local day containing `now`, expressed back in UTC.
pub fn start_of_local_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let midnight = local.date_naive().and_hms_opt(0, 0, 0).expect("valid midnight");
    resolve_local(tz, midnight)
}

/// Start of the account-local month containing `now`, expressed back in UTC.
pub fn start_of_local_month(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let first_of_month = local
        .date_naive()
        .with_day(1)
        .expect("every month has a 1st")
        .and_hms_opt(0, 0, 0)
        .expect("valid midnight");
    resolve_local(tz, first_of_month)
}

async fn posted_count_since(
    pool: &PgPool,
    account_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM schedules WHERE account_id = $1 AND status = $2 AND posted_at >= $3",
    )
    .bind(account_id)
    .bind(ScheduleStatus::Posted)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Runs the four-stage risk gate for one schedule about to be published.
pub async fn evaluate(
    pool: &PgPool,
    account: &Account,
    variant_body: &str,
    recent_corpus: &[String],
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<RiskOutcome, sqlx::Error> {
    // 1. Min interval.
    if let Some(last_posted_at) = account.last_posted_at {
        let earliest_next =
            last_posted_at + chrono::Duration::minutes(account.min_interval_minutes as i64);
        if earliest_next > now {
            return Ok(RiskOutcome::Rescheduled {
                planned_at: earliest_next,
                reason: format!(
                    "Minimum posting interval of {}m not yet reached; next eligible at {}.",
                    account.min_interval_minutes,
                    earliest_next.to_rfc3339()
                ),
            });
        }
    }

    // 2. Daily quota.
    let day_start = start_of_local_day(now, tz);
    let posted_today = posted_count_since(pool, account.id, day_start).await?;
    if posted_today >= account.daily_post_limit as i64 {
        return Ok(RiskOutcome::Blocked {
            reason: format!("Daily quota reached ({}).", account.daily_post_limit),
        });
    }

    // 3. Monthly quota.
    let month_start = start_of_local_month(now, tz);
    let posted_this_month = posted_count_since(pool, account.id, month_start).await?;
    if posted_this_month >= account.monthly_post_limit as i64 {
        return Ok(RiskOutcome::Blocked {
            reason: format!("Monthly quota reached ({}).", account.monthly_post_limit),
        });
    }

    // 4. Similarity against the cycle's sliding corpus.
    let corpus_refs = recent_corpus.iter().map(String::as_str);
    if too_similar(variant_body, corpus_refs, SIMILARITY_THRESHOLD) {
        return Ok(RiskOutcome::Blocked {
            reason: "Content too similar to recent published posts.".to_string(),
        });
    }

    Ok(RiskOutcome::Proceed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_day_boundary_is_midnight_in_the_configured_timezone() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 23, 30, 0).unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let start = start_of_local_day(now, tz);
        let local_start = start.with_timezone(&tz);
        assert_eq!(local_start.format("%H:%M:%S").to_string(), "00:00:00");
        assert_eq!(local_start.date_naive(), now.with_timezone(&tz).date_naive());
    }

    #[test]
    fn local_month_boundary_is_the_first_at_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        let start = start_of_local_month(now, chrono_tz::UTC);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
    }
}
