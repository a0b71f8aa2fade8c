//! Integration tests for the Dispatch Planner, including its idempotent-insert guarantee.

mod common;

use chrono::Utc;
use fleet_publisher::dispatch::{dispatch, DispatchMode, DispatchRequest};
use serial_test::serial;
use uuid::Uuid;

fn request(content_id: Uuid, account_ids: Vec<Uuid>, schedule_at: chrono::DateTime<Utc>) -> DispatchRequest {
    DispatchRequest {
        content_id,
        mode: DispatchMode::Manual { account_ids },
        schedule_at: Some(schedule_at),
        stagger_minutes: 5,
        priority: 100,
    }
}

#[tokio::test]
#[serial]
async fn dispatching_the_same_request_twice_inserts_zero_new_rows_the_second_time() {
    let pool = common::setup_test_db().await;
    let store = common::test_credential_store();
    let account = common::insert_account(&pool, &store, "kay").await;
    let content = common::insert_content(&pool, "Dispatch idempotency probe.").await;
    let schedule_at = Utc::now() + chrono::Duration::minutes(10);

    let first = dispatch(&pool, request(content.id, vec![account.id], schedule_at))
        .await
        .unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(first.skipped_duplicates, 0);

    let second = dispatch(&pool, request(content.id, vec![account.id], schedule_at))
        .await
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped_duplicates, 1);

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row_count, 1);
}

#[tokio::test]
#[serial]
async fn manual_mode_with_an_empty_account_list_is_an_error() {
    let pool = common::setup_test_db().await;
    let content = common::insert_content(&pool, "No targets.").await;

    let result = dispatch(&pool, request(content.id, vec![], Utc::now())).await;
    assert!(result.is_err());
}

#[tokio::test]
#[serial]
async fn rule_mode_matches_on_topic_tag_or_account_language() {
    let pool = common::setup_test_db().await;
    let store = common::test_credential_store();
    let matching_by_language = common::insert_account(&pool, &store, "leo").await;
    let non_matching = common::insert_account_with(&pool, &store, "mia", |a| {
        a.language = Some("fr".to_string());
    })
    .await;

    let content = common::insert_content(&pool, "Rule routing probe.").await;

    let summary = dispatch(
        &pool,
        DispatchRequest {
            content_id: content.id,
            mode: DispatchMode::Rule,
            schedule_at: Some(Utc::now()),
            stagger_minutes: 0,
            priority: 100,
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.targets, 1);
    let scheduled_account: uuid::Uuid =
        sqlx::query_scalar("SELECT account_id FROM schedules WHERE content_id = $1")
            .bind(content.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(scheduled_account, matching_by_language.id);
    assert_ne!(scheduled_account, non_matching.id);
}

#[tokio::test]
#[serial]
async fn stagger_minutes_spaces_out_planned_at_across_targets() {
    let pool = common::setup_test_db().await;
    let store = common::test_credential_store();
    let first = common::insert_account(&pool, &store, "nora").await;
    let second = common::insert_account(&pool, &store, "omar").await;
    let content = common::insert_content(&pool, "Stagger probe.").await;
    let schedule_at = Utc::now() + chrono::Duration::minutes(1);

    dispatch(
        &pool,
        DispatchRequest {
            content_id: content.id,
            mode: DispatchMode::Manual { account_ids: vec![first.id, second.id] },
            schedule_at: Some(schedule_at),
            stagger_minutes: 30,
            priority: 100,
        },
    )
    .await
    .unwrap();

    let planned_ats: Vec<chrono::DateTime<Utc>> = sqlx::query_scalar(
        "SELECT planned_at FROM schedules WHERE content_id = $1 ORDER BY planned_at ASC",
    )
    .bind(content.id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(planned_ats.len(), 2);
    assert_eq!(planned_ats[1] - planned_ats[0], chrono::Duration::minutes(30));
}
