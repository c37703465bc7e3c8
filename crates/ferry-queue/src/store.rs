//! Persistence contract behind [`DatabaseQueue`](crate::database::DatabaseQueue)
//!
//! A [`JobStore`] owns the `jobs` table. Its one piece of real concurrency
//! control is [`JobStore::claim_next`], which must select and reserve a row in
//! a single atomic step so that concurrent workers never claim the same
//! attempt of the same job. SQL implementations live in `ferry-persist`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Error recorded on rows whose last permitted attempt was never reported back
pub const EXPIRED_FINAL_ATTEMPT: &str = "reservation expired on final attempt";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One reservation of a row, as returned by [`JobStore::claim_next`].
///
/// Bookkeeping updates carry the claim and only apply while it is still the
/// row's current reservation. A worker whose reservation went stale and was
/// taken over cannot touch the row any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub job_id: Uuid,
    pub attempts: u32,
    pub reserved_at: i64,
}

/// Row to insert on dispatch
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_id: Uuid,
    pub queue_name: String,
    pub job_data: String,
    pub available_at: i64,
    pub created_at: i64,
    pub max_attempts: u32,
}

/// A persisted job row
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: i64,
    pub job_id: Uuid,
    pub queue_name: String,
    pub job_data: String,
    pub available_at: i64,
    pub created_at: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub reserved_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub failed_at: Option<i64>,
}

impl JobRecord {
    /// Whether a worker may claim this row at `now`.
    /// Reservations taken before `stale_before` count as abandoned.
    pub fn is_eligible(&self, queue_name: &str, now: i64, stale_before: i64) -> bool {
        self.queue_name == queue_name
            && self.completed_at.is_none()
            && self.failed_at.is_none()
            && self.available_at <= now
            && self.attempts < self.max_attempts
            && self.reserved_at.map_or(true, |reserved| reserved < stale_before)
    }

    /// A final attempt whose reservation went stale without being reported
    pub fn is_abandoned_final_attempt(&self, queue_name: &str, stale_before: i64) -> bool {
        self.queue_name == queue_name
            && !self.is_retired()
            && self.attempts >= self.max_attempts
            && self.reserved_at.is_some_and(|reserved| reserved < stale_before)
    }

    pub fn is_retired(&self) -> bool {
        self.completed_at.is_some() || self.failed_at.is_some()
    }

    /// The reservation currently held on this row, if any
    pub fn claim(&self) -> Option<Claim> {
        self.reserved_at.map(|reserved_at| Claim {
            job_id: self.job_id,
            attempts: self.attempts,
            reserved_at,
        })
    }

    fn holds(&self, claim: &Claim) -> bool {
        self.job_id == claim.job_id
            && self.attempts == claim.attempts
            && self.reserved_at == Some(claim.reserved_at)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row with zero attempts, returning its surrogate id
    async fn insert(&self, record: NewJobRecord) -> Result<i64, StoreError>;

    /// Atomically select the oldest eligible row of `queue_name` and reserve it.
    ///
    /// Rows are ordered by `available_at ASC, id ASC`. The claim increments
    /// `attempts` and sets `reserved_at = now` in the same step, skipping rows
    /// currently locked by other workers.
    ///
    /// Rows whose final attempt was reserved before `stale_before` are first
    /// marked failed with [`EXPIRED_FINAL_ATTEMPT`].
    async fn claim_next(
        &self,
        queue_name: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<Option<JobRecord>, StoreError>;

    // The updates below return `false` when `claim` is no longer the row's
    // current reservation (or the row is gone) and leave the row untouched.

    /// Retire a row after a successful attempt
    async fn complete(&self, claim: &Claim, now: i64) -> Result<bool, StoreError>;

    /// Drop the reservation so the row is immediately eligible again
    async fn release(&self, claim: &Claim, now: i64) -> Result<bool, StoreError>;

    /// Drop the reservation without spending it: `max_attempts` grows by one
    /// to cover the attempt the claim consumed
    async fn release_unattempted(&self, claim: &Claim) -> Result<bool, StoreError>;

    /// Retire a row as terminally failed
    async fn fail(&self, claim: &Claim, error: &str, now: i64) -> Result<bool, StoreError>;

    /// Rows that are neither completed nor failed
    async fn count(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Delete every row of a queue, returning how many were removed
    async fn clear(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// Distinct queue names present in the store
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    /// Delete completed rows older than `before`
    async fn prune_completed(&self, before: i64) -> Result<u64, StoreError>;
}

/// In-memory job store for tests/dev.
///
/// A single mutex around the table makes every operation atomic, which stands
/// in for row locking.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<Vec<JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a row, for inspection in tests
    pub fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let rows = self.lock()?;
        Ok(rows.iter().find(|r| r.job_id == job_id).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<JobRecord>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("job table mutex poisoned".to_string()))
    }

    fn update(&self, claim: &Claim, f: impl FnOnce(&mut JobRecord)) -> Result<bool, StoreError> {
        let mut rows = self.lock()?;
        let Some(row) = rows.iter_mut().find(|r| r.holds(claim)) else {
            return Ok(false);
        };
        f(row);
        Ok(true)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: NewJobRecord) -> Result<i64, StoreError> {
        let mut rows = self.lock()?;
        let id = rows.last().map_or(1, |r| r.id + 1);
        rows.push(JobRecord {
            id,
            job_id: record.job_id,
            queue_name: record.queue_name,
            job_data: record.job_data,
            available_at: record.available_at,
            created_at: record.created_at,
            attempts: 0,
            max_attempts: record.max_attempts,
            reserved_at: None,
            completed_at: None,
            error: None,
            failed_at: None,
        });
        Ok(id)
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut rows = self.lock()?;
        for row in rows
            .iter_mut()
            .filter(|r| r.is_abandoned_final_attempt(queue_name, stale_before))
        {
            warn!(job_id = %row.job_id, attempts = row.attempts, queue = queue_name, "Final attempt abandoned, marking row as failed");
            row.error = Some(EXPIRED_FINAL_ATTEMPT.to_string());
            row.failed_at = Some(now);
            row.reserved_at = None;
        }

        let next = rows
            .iter_mut()
            .filter(|r| r.is_eligible(queue_name, now, stale_before))
            .min_by_key(|r| (r.available_at, r.id));

        Ok(next.map(|row| {
            row.attempts += 1;
            row.reserved_at = Some(now);
            row.clone()
        }))
    }

    async fn complete(&self, claim: &Claim, now: i64) -> Result<bool, StoreError> {
        self.update(claim, |row| {
            row.completed_at = Some(now);
            row.reserved_at = None;
        })
    }

    async fn release(&self, claim: &Claim, now: i64) -> Result<bool, StoreError> {
        self.update(claim, |row| {
            row.reserved_at = None;
            row.available_at = now;
        })
    }

    async fn release_unattempted(&self, claim: &Claim) -> Result<bool, StoreError> {
        self.update(claim, |row| {
            row.max_attempts = row.max_attempts.saturating_add(1);
            row.reserved_at = None;
        })
    }

    async fn fail(&self, claim: &Claim, error: &str, now: i64) -> Result<bool, StoreError> {
        self.update(claim, |row| {
            row.error = Some(error.to_string());
            row.failed_at = Some(now);
            row.reserved_at = None;
        })
    }

    async fn count(&self, queue_name: &str) -> Result<u64, StoreError> {
        let rows = self.lock()?;
        Ok(rows
            .iter()
            .filter(|r| r.queue_name == queue_name && !r.is_retired())
            .count() as u64)
    }

    async fn clear(&self, queue_name: &str) -> Result<u64, StoreError> {
        let mut rows = self.lock()?;
        let before = rows.len();
        rows.retain(|r| r.queue_name != queue_name);
        Ok((before - rows.len()) as u64)
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.lock()?;
        let names: BTreeSet<_> = rows.iter().map(|r| r.queue_name.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn prune_completed(&self, before: i64) -> Result<u64, StoreError> {
        let mut rows = self.lock()?;
        let count = rows.len();
        rows.retain(|r| r.completed_at.map_or(true, |done| done >= before));
        Ok((count - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(queue: &str, available_at: i64) -> NewJobRecord {
        NewJobRecord {
            job_id: Uuid::new_v4(),
            queue_name: queue.to_string(),
            job_data: "{}".to_string(),
            available_at,
            created_at: 0,
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn test_claim_orders_by_available_at_then_id() {
        let store = MemoryJobStore::new();
        let late = new_record("q", 5);
        let first = new_record("q", 1);
        let second = new_record("q", 1);
        let (late_id, first_id, second_id) = (late.job_id, first.job_id, second.job_id);
        store.insert(late).await.unwrap();
        store.insert(first).await.unwrap();
        store.insert(second).await.unwrap();

        let claim = |now| store.claim_next("q", now, now - 60);
        assert_eq!(claim(10).await.unwrap().unwrap().job_id, first_id);
        assert_eq!(claim(10).await.unwrap().unwrap().job_id, second_id);
        assert_eq!(claim(10).await.unwrap().unwrap().job_id, late_id);
        assert!(claim(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_other_queues_and_future_rows() {
        let store = MemoryJobStore::new();
        store.insert(new_record("other", 0)).await.unwrap();
        store.insert(new_record("q", 100)).await.unwrap();

        assert!(store.claim_next("q", 50, -10).await.unwrap().is_none());
        assert!(store.claim_next("q", 100, 40).await.unwrap().is_some());
    }

    async fn claim(store: &MemoryJobStore, now: i64, stale_before: i64) -> Claim {
        store
            .claim_next("q", now, stale_before)
            .await
            .unwrap()
            .and_then(|record| record.claim())
            .unwrap()
    }

    #[tokio::test]
    async fn test_stale_reservation_is_reclaimable() {
        let store = MemoryJobStore::new();
        let record = new_record("q", 0);
        let job_id = record.job_id;
        store.insert(record).await.unwrap();

        let first = claim(&store, 10, -50).await;
        assert_eq!(first.attempts, 1);
        assert_eq!(first.reserved_at, 10);

        // Reservation still fresh
        assert!(store.claim_next("q", 20, -40).await.unwrap().is_none());

        // Reserved at 10, which is before the stale cutoff of 11
        let second = claim(&store, 71, 11).await;
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.attempts, 2);

        // max_attempts = 2 reached
        assert!(store.release(&second, 72).await.unwrap());
        assert!(store.claim_next("q", 200, 140).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_superseded_claim_cannot_touch_the_row() {
        let store = MemoryJobStore::new();
        let mut record = new_record("q", 0);
        record.max_attempts = 3;
        let job_id = record.job_id;
        store.insert(record).await.unwrap();

        let stale = claim(&store, 10, -50).await;
        let current = claim(&store, 100, 40).await;
        assert_eq!(current.attempts, 2);

        // The late report of the first worker is ignored
        assert!(!store.release(&stale, 101).await.unwrap());
        assert!(!store.release_unattempted(&stale).await.unwrap());
        assert!(!store.fail(&stale, "late", 101).await.unwrap());
        assert!(store.claim_next("q", 102, 42).await.unwrap().is_none());

        let row = store.get(job_id).unwrap().unwrap();
        assert_eq!(row.reserved_at, Some(100));
        assert!(row.failed_at.is_none());

        assert!(store.complete(&current, 103).await.unwrap());
        assert!(!store.fail(&stale, "late", 104).await.unwrap());
        assert!(!store.complete(&current, 104).await.unwrap());

        let row = store.get(job_id).unwrap().unwrap();
        assert_eq!(row.completed_at, Some(103));
        assert!(row.failed_at.is_none() && row.error.is_none());
    }

    #[tokio::test]
    async fn test_unattempted_release_keeps_the_job_claimable() {
        let store = MemoryJobStore::new();
        let mut record = new_record("q", 5);
        record.max_attempts = 1;
        let job_id = record.job_id;
        store.insert(record).await.unwrap();

        let held = claim(&store, 10, 0).await;
        assert!(store.release_unattempted(&held).await.unwrap());

        let row = store.get(job_id).unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.max_attempts, 2);
        assert_eq!(row.available_at, 5);
        assert!(row.reserved_at.is_none());

        let again = claim(&store, 11, 0).await;
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_abandoned_final_attempt_is_failed_on_next_claim() {
        let store = MemoryJobStore::new();
        let mut record = new_record("q", 0);
        record.max_attempts = 1;
        let job_id = record.job_id;
        store.insert(record).await.unwrap();
        store.insert(new_record("other", 0)).await.unwrap();

        let held = claim(&store, 10, 0).await;

        // Still within the window
        assert!(store.claim_next("q", 20, 10).await.unwrap().is_none());
        assert!(store.get(job_id).unwrap().unwrap().failed_at.is_none());

        assert!(store.claim_next("q", 500, 11).await.unwrap().is_none());
        let row = store.get(job_id).unwrap().unwrap();
        assert_eq!(row.failed_at, Some(500));
        assert_eq!(row.error.as_deref(), Some(EXPIRED_FINAL_ATTEMPT));
        assert!(row.reserved_at.is_none());
        assert_eq!(store.count("q").await.unwrap(), 0);
        assert_eq!(store.count("other").await.unwrap(), 1);

        // The worker that overran its reservation can no longer report
        assert!(!store.complete(&held, 501).await.unwrap());
    }

    #[tokio::test]
    async fn test_retired_rows_are_not_counted_or_claimed() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.insert(new_record("q", 0)).await.unwrap();
        }

        let done = claim(&store, 5, 0).await;
        let failed = claim(&store, 5, 0).await;
        store.complete(&done, 5).await.unwrap();
        store.fail(&failed, "boom", 5).await.unwrap();

        assert_eq!(store.count("q").await.unwrap(), 1);
        let failed_row = store.get(failed.job_id).unwrap().unwrap();
        assert_eq!(failed_row.error.as_deref(), Some("boom"));
        assert_eq!(failed_row.failed_at, Some(5));

        let open = store.claim_next("q", 10, 0).await.unwrap().unwrap();
        assert!(open.completed_at.is_none() && open.failed_at.is_none());
        assert!(store.claim_next("q", 10, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_prune_and_queue_names() {
        let store = MemoryJobStore::new();
        store.insert(new_record("mail", 0)).await.unwrap();
        store.insert(new_record("mail", 0)).await.unwrap();
        store.insert(new_record("events", 0)).await.unwrap();

        assert_eq!(store.queue_names().await.unwrap(), vec!["events", "mail"]);

        let done = store.claim_next("mail", 100, 0).await.unwrap().unwrap();
        store.complete(&done.claim().unwrap(), 100).await.unwrap();
        assert_eq!(store.prune_completed(50).await.unwrap(), 0);
        assert_eq!(store.prune_completed(101).await.unwrap(), 1);

        assert_eq!(store.clear("mail").await.unwrap(), 1);
        assert_eq!(store.queue_names().await.unwrap(), vec!["events"]);
    }

    #[tokio::test]
    async fn test_unknown_claim_is_ignored() {
        let store = MemoryJobStore::new();
        let missing = Claim {
            job_id: Uuid::new_v4(),
            attempts: 1,
            reserved_at: 0,
        };
        assert!(!store.complete(&missing, 0).await.unwrap());
    }
}
