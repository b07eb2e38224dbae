//! Job repository integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test --test job_repository -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `kazari_test`)
//!   `TEST_DB_PASSWORD` (default: `kazari_test`)
//!   `TEST_DB_NAME` (default: `kazari_test`)

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use kazari_common::IdGenerator;
use kazari_db::entities::JobStatus;
use kazari_db::repositories::{JobDiagnostics, JobRepository};
use kazari_db::test_utils::TestDatabase;
use serde_json::json;

const QUEUE: &str = "background-task";

async fn setup() -> (TestDatabase, JobRepository) {
    let db = TestDatabase::create_unique()
        .await
        .expect("Failed to create test database");
    let repo = JobRepository::new(Arc::new(db.conn.clone()));
    (db, repo)
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_insert_and_claim_lifecycle() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    let inserted = repo
        .insert_queued(&id, QUEUE, json!({"kind": "test"}), None)
        .await
        .unwrap();
    assert!(inserted);

    let job = repo.get_by_id(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());
    assert!(job.finished_at.is_none());

    let claimed = repo.claim_next(QUEUE).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.started_at.is_some());

    // Queue is now empty; a second claim finds nothing
    assert!(repo.claim_next(QUEUE).await.unwrap().is_none());

    let done = repo.mark_completed(&id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.finished_at.is_some());

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_claim_is_fifo_by_insertion() {
    let (db, repo) = setup().await;
    let id_gen = IdGenerator::new();

    let first = id_gen.generate();
    let second = id_gen.generate();
    repo.insert_queued(&first, QUEUE, json!({"n": 1}), None)
        .await
        .unwrap();
    repo.insert_queued(&second, QUEUE, json!({"n": 2}), None)
        .await
        .unwrap();

    assert_eq!(repo.claim_next(QUEUE).await.unwrap().unwrap().id, first);
    assert_eq!(repo.claim_next(QUEUE).await.unwrap().unwrap().id, second);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_mutex_coalesces_duplicate_enqueues() {
    let (db, repo) = setup().await;
    let id_gen = IdGenerator::new();

    let first = id_gen.generate();
    let second = id_gen.generate();
    assert!(repo
        .insert_queued(&first, QUEUE, json!({}), Some("backfill:thread1"))
        .await
        .unwrap());
    // Same mutex while the first is non-terminal: coalesced
    assert!(!repo
        .insert_queued(&second, QUEUE, json!({}), Some("backfill:thread1"))
        .await
        .unwrap());
    assert!(repo.find_by_id(&second).await.unwrap().is_none());

    // Once the first reaches a terminal state the mutex frees up
    repo.claim_next(QUEUE).await.unwrap().unwrap();
    repo.mark_completed(&first).await.unwrap();
    assert!(repo
        .insert_queued(&second, QUEUE, json!({}), Some("backfill:thread1"))
        .await
        .unwrap());

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_delayed_promotion() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    let past = Utc::now() - Duration::seconds(1);
    repo.insert_delayed(&id, QUEUE, json!({}), past)
        .await
        .unwrap();

    // Nothing to claim before promotion
    assert!(repo.claim_next(QUEUE).await.unwrap().is_none());

    let promoted = repo.promote_due(QUEUE).await.unwrap();
    assert_eq!(promoted, 1);
    assert_eq!(
        repo.get_by_id(&id).await.unwrap().status,
        JobStatus::Queued
    );

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_future_delayed_job_is_not_promoted() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    let future = Utc::now() + Duration::seconds(60);
    repo.insert_delayed(&id, QUEUE, json!({}), future)
        .await
        .unwrap();

    assert_eq!(repo.promote_due(QUEUE).await.unwrap(), 0);
    let next = repo.next_delayed_at(QUEUE).await.unwrap().unwrap();
    assert!((next - future).num_seconds().abs() < 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_requeue_running_for_recovery() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    repo.insert_queued(&id, QUEUE, json!({}), None)
        .await
        .unwrap();
    repo.claim_next(QUEUE).await.unwrap().unwrap();

    let requeued = repo.requeue_running(Some(QUEUE)).await.unwrap();
    assert_eq!(requeued, 1);
    let job = repo.get_by_id(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    // started_at is kept: the job has left Queued at least once
    assert!(job.started_at.is_some());

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_fail_stalled_tags_distinctly() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    repo.insert_queued(&id, QUEUE, json!({}), None)
        .await
        .unwrap();
    repo.claim_next(QUEUE).await.unwrap().unwrap();

    // A cutoff in the future makes the just-claimed job count as stalled
    let stalled = repo
        .fail_stalled(QUEUE, Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(stalled, vec![id.clone()]);

    let job = repo.get_by_id(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exception.as_deref(), Some("stalled"));
    assert!(job.finished_at.is_some());

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_retry_resets_failed_job() {
    let (db, repo) = setup().await;
    let id = IdGenerator::new().generate();

    repo.insert_queued(&id, QUEUE, json!({}), None)
        .await
        .unwrap();
    repo.claim_next(QUEUE).await.unwrap().unwrap();
    repo.mark_failed(
        &id,
        JobDiagnostics {
            message: Some("boom".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let retried = repo.retry(&id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.exception_message.is_none());
    assert!(retried.finished_at.is_none());

    // Retrying a non-failed job is rejected
    assert!(repo.retry(&id).await.is_err());

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_counts_group_by_status() {
    let (db, repo) = setup().await;
    let id_gen = IdGenerator::new();

    for _ in 0..3 {
        repo.insert_queued(&id_gen.generate(), QUEUE, json!({}), None)
            .await
            .unwrap();
    }
    repo.insert_delayed(
        &id_gen.generate(),
        QUEUE,
        json!({}),
        Utc::now() + Duration::seconds(60),
    )
    .await
    .unwrap();
    repo.claim_next(QUEUE).await.unwrap().unwrap();

    let counts = repo.counts(QUEUE).await.unwrap();
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.running, 1);
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.failed, 0);

    db.drop_database().await.unwrap();
}
