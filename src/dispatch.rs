//! Content→accounts routing, stagger, variant creation, idempotent schedule insert.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Account, ActivityLevel, Content, ScheduleStatus};
use crate::similarity::fingerprint;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("manual mode requires a non-empty list of account ids")]
    EmptyAccountList,
    #[error("no accounts matched the rule-based selection for this content")]
    NoAccountsMatched,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub enum DispatchMode {
    Manual { account_ids: Vec<Uuid> },
    Rule,
}

impl DispatchMode {
    fn label(&self) -> &'static str {
        match self {
            DispatchMode::Manual { .. } => "manual",
            DispatchMode::Rule => "rule",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub content_id: Uuid,
    pub mode: DispatchMode,
    pub schedule_at: Option<DateTime<Utc>>,
    pub stagger_minutes: i32,
    pub priority: i32,
}

#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub targets: usize,
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

/// The per-index template bank used to generate a variant body when none exists yet for a
/// (content, account) pair.
const TEMPLATE_BANK: &[&str] = &[
    "{body}",
    "{body}\n\nThoughts?",
    "New: {body}",
    "{body} — more soon.",
    "Worth a look: {body}",
    "{body}\n\nShare if you agree.",
];

fn generate_variant_body(content: &Content, account: &Account, index: usize) -> String {
    let template = TEMPLATE_BANK[index % TEMPLATE_BANK.len()];
    let mut body = template.replace("{body}", &content.body);

    if index % 2 == 1 {
        body = format!("{body}\n\n(@{} edition)", account.username);
    }

    if account
        .language
        .as_deref()
        .is_some_and(|lang| lang.to_lowercase().starts_with("zh"))
    {
        body.push_str("\n\n欢迎转发和评论。");
    }

    body
}

async fn select_accounts_manual(
    pool: &PgPool,
    account_ids: &[Uuid],
) -> Result<Vec<Account>, DispatchError> {
    if account_ids.is_empty() {
        return Err(DispatchError::EmptyAccountList);
    }
    let mut deduped = account_ids.to_vec();
    deduped.sort();
    deduped.dedup();

    let accounts =
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ANY($1)")
            .bind(&deduped)
            .fetch_all(pool)
            .await?;
    Ok(accounts)
}

async fn select_accounts_rule(pool: &PgPool, content: &Content) -> Result<Vec<Account>, DispatchError> {
    let topic = content.topic.as_deref().map(|t| t.trim().to_lowercase());
    let language = content.language.as_deref().map(|l| l.trim().to_lowercase());

    let accounts = sqlx::query_as::<_, Account>(
        r#"
        SELECT DISTINCT a.*
        FROM accounts a
        LEFT JOIN account_tags at ON at.account_id = a.id
        LEFT JOIN tags t ON t.id = at.tag_id
        WHERE
            ($1::text IS NOT NULL AND lower(trim(t.name)) = $1)
            OR ($2::text IS NOT NULL AND lower(trim(a.language)) = $2)
        "#,
    )
    .bind(topic)
    .bind(language)
    .fetch_all(pool)
    .await?;

    if accounts.is_empty() {
        return Err(DispatchError::NoAccountsMatched);
    }
    Ok(accounts)
}

/// Materializes schedules from one content and a target set of accounts. All inserts for a
/// single dispatch run in one transaction together with an activity-log entry.
pub async fn dispatch(pool: &PgPool, request: DispatchRequest) -> Result<DispatchSummary, DispatchError> {
    let content: Content = sqlx::query_as("SELECT * FROM content WHERE id = $1")
        .bind(request.content_id)
        .fetch_one(pool)
        .await?;

    let accounts = match &request.mode {
        DispatchMode::Manual { account_ids } => select_accounts_manual(pool, account_ids).await?,
        DispatchMode::Rule => select_accounts_rule(pool, &content).await?,
    };

    let schedule_at = request.schedule_at.unwrap_or_else(Utc::now);
    let mut summary = DispatchSummary {
        targets: accounts.len(),
        ..Default::default()
    };

    let mut tx = pool.begin().await?;

    for (index, account) in accounts.iter().enumerate() {
        let variant_id = ensure_variant(&mut tx, &content, account, index).await?;
        let planned_at =
            schedule_at + chrono::Duration::minutes((index as i32 * request.stagger_minutes) as i64);
        let idempotency_key =
            crate::domain::Schedule::default_idempotency_key(content.id, account.id, planned_at);

        let result = sqlx::query(
            r#"
            INSERT INTO schedules
                (id, account_id, content_id, content_variant_id, planned_at, status,
                 idempotency_key, priority, attempt_count, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account.id)
        .bind(content.id)
        .bind(variant_id)
        .bind(planned_at)
        .bind(ScheduleStatus::Pending)
        .bind(&idempotency_key)
        .bind(request.priority)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            summary.inserted += 1;
        } else {
            summary.skipped_duplicates += 1;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO activity_log (id, level, event, message, meta, account_id, schedule_id)
        VALUES ($1, $2, 'content_dispatched', $3, $4, NULL, NULL)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(ActivityLevel::Info)
    .bind(format!(
        "Dispatched content {} to {} account(s) ({} inserted, {} duplicate).",
        content.id, summary.targets, summary.inserted, summary.skipped_duplicates
    ))
    .bind(json!({
        "mode": request.mode.label(),
        "staggerMinutes": request.stagger_minutes,
        "priority": request.priority,
    }))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(summary)
}

async fn ensure_variant(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    content: &Content,
    account: &Account,
    index: usize,
) -> Result<Uuid, sqlx::Error> {
    if let Some(existing) = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM content_variants WHERE content_id = $1 AND account_id = $2",
    )
    .bind(content.id)
    .bind(account.id)
    .fetch_optional(&mut **tx)
    .await?
    {
        return Ok(existing);
    }

    let body = generate_variant_body(content, account, index);
    let similarity_key = fingerprint(&body);
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO content_variants (id, content_id, account_id, body, similarity_key) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(content.id)
    .bind(account.id)
    .bind(&body)
    .bind(&similarity_key)
    .execute(&mut **tx)
    .await?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountStatus, ContentStatus};

    fn sample_content() -> Content {
        Content {
            id: Uuid::new_v4(),
            title: "Launch day".into(),
            body: "We shipped something new today.".into(),
            topic: Some("rust".into()),
            language: Some("en".into()),
            status: ContentStatus::Approved,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_account(username: &str, language: Option<&str>) -> Account {
        Account {
            id: Uuid::new_v4(),
            x_user_id: "123".into(),
            username: username.into(),
            display_name: username.into(),
            language: language.map(str::to_string),
            purpose: None,
            access_token_enc: "enc".into(),
            refresh_token_enc: None,
            token_expires_at: None,
            status: AccountStatus::Active,
            health_message: None,
            min_interval_minutes: 30,
            daily_post_limit: 10,
            monthly_post_limit: 100,
            last_posted_at: None,
            proxy_enabled: false,
            proxy_protocol: None,
            proxy_host: None,
            proxy_port: None,
            proxy_username: None,
            proxy_password_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn odd_index_variants_get_the_username_tag() {
        let content = sample_content();
        let account = sample_account("bob", Some("en"));
        let even = generate_variant_body(&content, &account, 0);
        let odd = generate_variant_body(&content, &account, 1);
        assert!(!even.contains("@bob"));
        assert!(odd.contains("(@bob edition)"));
    }

    #[test]
    fn chinese_language_accounts_get_the_cta_line() {
        let content = sample_content();
        let account = sample_account("li", Some("zh-CN"));
        let body = generate_variant_body(&content, &account, 0);
        assert!(body.contains("欢迎转发和评论"));
    }

    #[test]
    fn english_accounts_never_get_the_cta_line() {
        let content = sample_content();
        let account = sample_account("bob", Some("en"));
        for index in 0..TEMPLATE_BANK.len() {
            assert!(!generate_variant_body(&content, &account, index).contains("欢迎"));
        }
    }
}
