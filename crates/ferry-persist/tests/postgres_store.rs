//! Runs only when `FERRY_TEST_POSTGRES_URL` points at a scratch database.

#![cfg(feature = "postgres")]

use std::collections::HashSet;

use uuid::Uuid;

use ferry_persist::{PostgresJobStore, StoreConfig};
use ferry_queue::{JobStore, NewJobRecord};

async fn store() -> Option<PostgresJobStore> {
    let Ok(url) = std::env::var("FERRY_TEST_POSTGRES_URL") else {
        eprintln!("FERRY_TEST_POSTGRES_URL not set, skipping");
        return None;
    };
    let store = PostgresJobStore::connect_with_config(&StoreConfig::new(url).max_connections(8))
        .await
        .expect("postgres should be reachable");
    Some(store)
}

fn record(queue: &str, available_at: i64) -> NewJobRecord {
    NewJobRecord {
        job_id: Uuid::new_v4(),
        queue_name: queue.to_string(),
        job_data: "{}".to_string(),
        available_at,
        created_at: 0,
        max_attempts: 2,
    }
}

fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_postgres_claim_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let queue = unique_queue("lifecycle");

    let late = record(&queue, 20);
    let early = record(&queue, 10);
    let (late_id, early_id) = (late.job_id, early.job_id);
    store.insert(late).await?;
    store.insert(early).await?;
    assert_eq!(store.count(&queue).await?, 2);

    let claimed = store.claim_next(&queue, 100, 0).await?.expect("early row");
    assert_eq!(claimed.job_id, early_id);
    assert_eq!(claimed.attempts, 1);
    assert!(store.complete(&claimed.claim().expect("reserved"), 101).await?);

    let claimed = store.claim_next(&queue, 100, 0).await?.expect("late row");
    assert_eq!(claimed.job_id, late_id);
    let first = claimed.claim().expect("reserved");
    assert!(store.release(&first, 100).await?);

    let retried = store.claim_next(&queue, 100, 0).await?.expect("released row");
    assert_eq!(retried.attempts, 2);

    // The earlier reservation of the same row no longer applies
    assert!(!store.fail(&first, "late", 102).await?);
    assert!(store.fail(&retried.claim().expect("reserved"), "exhausted", 102).await?);

    assert!(store.claim_next(&queue, 1_000, 900).await?.is_none());
    assert_eq!(store.count(&queue).await?, 0);
    assert_eq!(store.clear(&queue).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_postgres_abandoned_final_attempt_is_failed() -> Result<(), Box<dyn std::error::Error>> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let queue = unique_queue("abandoned");
    let mut job = record(&queue, 0);
    job.max_attempts = 1;
    store.insert(job).await?;

    let held = store.claim_next(&queue, 100, 0).await?.expect("row");
    assert!(store.claim_next(&queue, 10_100, 101).await?.is_none());
    assert_eq!(store.count(&queue).await?, 0);
    assert!(!store.complete(&held.claim().expect("reserved"), 10_101).await?);

    store.clear(&queue).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_skip_locked_claims_are_disjoint() -> Result<(), Box<dyn std::error::Error>> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let queue = unique_queue("concurrent");
    for _ in 0..40 {
        store.insert(record(&queue, 0)).await?;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(row) = store.claim_next(&queue, 10, 0).await.unwrap() {
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
    assert_eq!(seen.len(), 40);

    store.clear(&queue).await?;
    Ok(())
}
