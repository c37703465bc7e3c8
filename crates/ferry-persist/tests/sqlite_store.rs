#![cfg(feature = "sqlite")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ferry_persist::{SqliteJobStore, StoreConfig};
use ferry_queue::{
    Claim, DatabaseQueue, Job, JobEnvelope, JobStore, ManualClock, NewJobRecord, Queue, QueueError,
    EXPIRED_FINAL_ATTEMPT,
};

#[derive(Debug, Serialize, Deserialize)]
struct Report {
    name: String,
}

impl Job for Report {
    const JOB_TYPE: &'static str = "report";

    fn job_name(&self) -> String {
        self.name.clone()
    }
}

async fn memory_store() -> SqliteJobStore {
    SqliteJobStore::connect_with_config(&StoreConfig::memory())
        .await
        .expect("in-memory SQLite should open")
}

fn record(queue: &str, available_at: i64, max_attempts: u32) -> NewJobRecord {
    NewJobRecord {
        job_id: Uuid::new_v4(),
        queue_name: queue.to_string(),
        job_data: "{}".to_string(),
        available_at,
        created_at: 0,
        max_attempts,
    }
}

async fn claim(store: &SqliteJobStore, now: i64, stale_before: i64) -> Claim {
    store
        .claim_next("reports", now, stale_before)
        .await
        .unwrap()
        .and_then(|record| record.claim())
        .expect("row should be claimable")
}

async fn column<T>(store: &SqliteJobStore, name: &str, job_id: Uuid) -> T
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + Unpin,
{
    let sql = format!("SELECT {name} FROM jobs WHERE job_id = ?");
    sqlx::query_scalar(&sql)
        .bind(job_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap()
}

fn envelope(name: &str) -> JobEnvelope {
    JobEnvelope::new(&Report { name: name.to_string() }, 3, 0).unwrap()
}

#[tokio::test]
async fn test_claim_orders_by_available_at_then_id() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let late = record("reports", 50, 3);
    let first = record("reports", 10, 3);
    let second = record("reports", 10, 3);
    let expected = [first.job_id, second.job_id, late.job_id];

    let late_row = store.insert(late).await?;
    let first_row = store.insert(first).await?;
    assert!(first_row > late_row);
    store.insert(second).await?;

    for job_id in expected {
        let claimed = store.claim_next("reports", 100, 0).await?.expect("row should be claimable");
        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.reserved_at, Some(100));
    }
    assert!(store.claim_next("reports", 100, 0).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_claim_respects_availability_and_queue() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    store.insert(record("other", 0, 3)).await?;
    store.insert(record("reports", 100, 3)).await?;

    assert!(store.claim_next("reports", 99, 0).await?.is_none());
    assert!(store.claim_next("reports", 100, 0).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_stale_reservation_is_reclaimed() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let job = record("reports", 0, 2);
    let job_id = job.job_id;
    store.insert(job).await?;

    claim(&store, 1_000, 700).await;

    // Reservation at 1000 is not older than the cutoff
    assert!(store.claim_next("reports", 1_300, 1_000).await?.is_none());

    let reclaimed = claim(&store, 1_301, 1_001).await;
    assert_eq!(reclaimed.job_id, job_id);
    assert_eq!(reclaimed.attempts, 2);

    // Out of attempts
    assert!(store.release(&reclaimed, 1_302).await?);
    assert!(store.claim_next("reports", 5_000, 4_000).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_superseded_claim_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let job = record("reports", 0, 3);
    let job_id = job.job_id;
    store.insert(job).await?;

    let stale = claim(&store, 1_000, 0).await;
    let current = claim(&store, 1_061, 1_001).await;

    assert!(!store.release(&stale, 1_062).await?);
    assert!(!store.release_unattempted(&stale).await?);
    assert!(!store.fail(&stale, "late", 1_062).await?);
    assert!(store.claim_next("reports", 1_063, 1_003).await?.is_none());

    assert!(store.complete(&current, 1_064).await?);
    assert!(!store.fail(&stale, "late", 1_065).await?);

    assert_eq!(column::<Option<i64>>(&store, "completed_at", job_id).await, Some(1_064));
    assert_eq!(column::<Option<i64>>(&store, "failed_at", job_id).await, None);
    assert_eq!(column::<Option<String>>(&store, "error", job_id).await, None);
    Ok(())
}

#[tokio::test]
async fn test_unattempted_release_keeps_the_job() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let job = record("reports", 0, 1);
    let job_id = job.job_id;
    store.insert(job).await?;

    let held = claim(&store, 10, 0).await;
    assert!(store.release_unattempted(&held).await?);
    assert_eq!(column::<i64>(&store, "attempts", job_id).await, 1);
    assert_eq!(column::<i64>(&store, "max_attempts", job_id).await, 2);

    let again = claim(&store, 11, 0).await;
    assert_eq!(again.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_final_attempt_is_failed() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let job = record("reports", 0, 1);
    let job_id = job.job_id;
    store.insert(job).await?;

    let held = claim(&store, 100, 0).await;
    assert!(store.claim_next("reports", 150, 100).await?.is_none());
    assert_eq!(store.count("reports").await?, 1);

    assert!(store.claim_next("reports", 10_100, 101).await?.is_none());
    assert_eq!(store.count("reports").await?, 0);
    assert_eq!(column::<Option<i64>>(&store, "failed_at", job_id).await, Some(10_100));
    assert_eq!(
        column::<Option<String>>(&store, "error", job_id).await.as_deref(),
        Some(EXPIRED_FINAL_ATTEMPT)
    );
    assert!(!store.complete(&held, 10_101).await?);
    Ok(())
}

#[tokio::test]
async fn test_complete_and_fail_retire_rows() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    for _ in 0..3 {
        store.insert(record("reports", 0, 3)).await?;
    }
    assert_eq!(store.count("reports").await?, 3);

    let done = claim(&store, 10, 0).await;
    let failed = claim(&store, 10, 0).await;
    assert!(store.complete(&done, 10).await?);
    assert!(store.fail(&failed, "boom", 10).await?);
    assert_eq!(store.count("reports").await?, 1);

    let open = claim(&store, 20, 0).await;
    assert_ne!(open.job_id, done.job_id);
    assert_ne!(open.job_id, failed.job_id);
    assert!(store.claim_next("reports", 20, 0).await?.is_none());

    let missing = Claim {
        job_id: Uuid::new_v4(),
        attempts: 1,
        reserved_at: 0,
    };
    assert!(!store.complete(&missing, 0).await?);
    Ok(())
}

#[tokio::test]
async fn test_clear_prune_and_queue_names() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    store.insert(record("mail", 0, 3)).await?;
    store.insert(record("mail", 0, 3)).await?;
    store.insert(record("events", 0, 3)).await?;

    assert_eq!(store.queue_names().await?, vec!["events", "mail"]);

    let old = store.claim_next("mail", 100, 0).await?.expect("mail row");
    store.complete(&old.claim().expect("reserved"), 100).await?;
    assert_eq!(store.prune_completed(100).await?, 0);
    assert_eq!(store.prune_completed(101).await?, 1);

    assert_eq!(store.clear("mail").await?, 1);
    assert_eq!(store.queue_names().await?, vec!["events"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_row() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    for _ in 0..20 {
        store.insert(record("reports", 0, 1)).await?;
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(row) = store.claim_next("reports", 10, 0).await.unwrap() {
                claimed.push(row.job_id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for job_id in handle.await? {
            assert!(seen.insert(job_id), "job {job_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
    Ok(())
}

#[tokio::test]
async fn test_database_queue_over_sqlite() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(memory_store().await);
    let clock = ManualClock::arc(1_000);
    let queue = DatabaseQueue::with_clock("reports", store.clone(), clock.clone(), Duration::from_secs(300));

    queue.dispatch(envelope("value-1"), 0).await?;
    queue.dispatch(envelope("value-2"), 0).await?;
    queue.dispatch(envelope("later"), 10).await?;
    assert_eq!(queue.count().await?, 3);

    let first = queue.pop_job().await?.expect("first job");
    assert_eq!(first.job_name, "value-1");
    assert_eq!(first.attempts, 1);
    queue.complete(&first).await?;

    let second = queue.pop_job().await?.expect("second job");
    assert_eq!(second.job_name, "value-2");
    queue.fail(&second, "try again", true).await?;

    // Released row is available immediately and ahead of the delayed one
    let retried = queue.pop_job().await?.expect("retried job");
    assert_eq!(retried.job_id, second.job_id);
    assert_eq!(retried.attempts, 2);
    queue.fail(&retried, "give up", false).await?;

    assert!(queue.pop_job().await?.is_none());
    clock.advance(10);
    let later = queue.pop_job().await?.expect("delayed job");
    assert_eq!(later.job_name, "later");

    // Completed and failed rows are not counted; the claimed delayed row is
    assert_eq!(queue.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_malformed_row_is_failed_once() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(memory_store().await);
    let clock = ManualClock::arc(0);
    let queue = DatabaseQueue::with_clock("reports", store.clone(), clock, Duration::from_secs(60));

    let bad = envelope("bad");
    let bad_id = bad.job_id;
    queue.dispatch(bad, 0).await?;
    queue.dispatch(envelope("good"), 0).await?;

    sqlx::query("UPDATE jobs SET job_data = 'not json' WHERE job_id = ?")
        .bind(bad_id.to_string())
        .execute(store.pool())
        .await?;

    assert!(matches!(queue.pop_job().await, Err(QueueError::Serialization(_))));
    assert_eq!(queue.pop_job().await?.expect("good job").job_name, "good");
    assert!(queue.pop_job().await?.is_none());

    let error: Option<String> = sqlx::query_scalar("SELECT error FROM jobs WHERE job_id = ?")
        .bind(bad_id.to_string())
        .fetch_one(store.pool())
        .await?;
    assert!(error.unwrap_or_default().starts_with("malformed job payload"));
    Ok(())
}

#[tokio::test]
async fn test_late_report_does_not_free_a_reclaimed_row() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(memory_store().await);
    let clock = ManualClock::arc(1_000);
    let queue = DatabaseQueue::with_clock("reports", store.clone(), clock.clone(), Duration::from_secs(60));

    let job = envelope("slow");
    let job_id = job.job_id;
    queue.dispatch(job, 0).await?;

    let slow = queue.pop_job().await?.expect("first claim");
    clock.advance(61);
    let current = queue.pop_job().await?.expect("stale reclaim");
    assert_eq!(current.attempts, 2);

    queue.fail(&slow, "slow retry", true).await?;
    assert!(queue.pop_job().await?.is_none());

    queue.complete(&current).await?;
    queue.fail(&slow, "slow fatal", false).await?;

    assert_eq!(column::<Option<i64>>(&store, "completed_at", job_id).await, Some(1_061));
    assert_eq!(column::<Option<i64>>(&store, "failed_at", job_id).await, None);
    assert_eq!(column::<Option<String>>(&store, "error", job_id).await, None);
    Ok(())
}

#[tokio::test]
async fn test_negative_attempts_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let store = memory_store().await;
    let job = record("reports", 0, 3);
    let job_id = job.job_id;
    store.insert(job).await?;

    sqlx::query("UPDATE jobs SET max_attempts = -1, attempts = -5 WHERE job_id = ?")
        .bind(job_id.to_string())
        .execute(store.pool())
        .await?;

    let err = store.claim_next("reports", 10, 0).await.unwrap_err();
    assert!(err.to_string().contains("Invalid attempts in DB"));
    Ok(())
}
