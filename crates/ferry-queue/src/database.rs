//! Persistent queue shared across worker processes

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::backend::{Queue, QueueError};
use crate::clock::{Clock, SystemClock};
use crate::job::JobEnvelope;
use crate::store::{Claim, JobStore, NewJobRecord, StoreError};

/// Queue backed by a [`JobStore`].
///
/// Workers coordinate only through the store's atomic claim. A worker that
/// dies mid-job leaves its row reserved until `staleness_window` passes, after
/// which any worker may claim it again.
pub struct DatabaseQueue {
    name: String,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    staleness_window: Duration,
}

impl std::fmt::Debug for DatabaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseQueue")
            .field("name", &self.name)
            .field("staleness_window", &self.staleness_window)
            .finish()
    }
}

impl DatabaseQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn JobStore>, staleness_window: Duration) -> Self {
        Self::with_clock(name, store, Arc::new(SystemClock), staleness_window)
    }

    pub fn with_clock(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        staleness_window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            staleness_window,
        }
    }

    fn stale_before(&self, now: i64) -> i64 {
        let window = i64::try_from(self.staleness_window.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(window)
    }

    fn claim(envelope: &JobEnvelope) -> Result<Claim, QueueError> {
        envelope.claim.ok_or(QueueError::NotClaimed(envelope.job_id))
    }

    fn lost_claim(&self, claim: &Claim, action: &str) {
        warn!(
            job_id = %claim.job_id,
            attempt = claim.attempts,
            queue = %self.name,
            action,
            "Reservation was taken over by another worker, dropping the update"
        );
    }
}

#[async_trait]
impl Queue for DatabaseQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, envelope: JobEnvelope, delay_secs: u64) -> Result<(), QueueError> {
        let now = self.clock.now();
        let record = NewJobRecord {
            job_id: envelope.job_id,
            queue_name: self.name.clone(),
            job_data: envelope.to_json()?,
            available_at: now.saturating_add_unsigned(delay_secs),
            created_at: envelope.created_at,
            max_attempts: envelope.max_attempts,
        };

        let id = self.store.insert(record).await?;
        debug!(job_id = %envelope.job_id, row_id = id, queue = %self.name, delay_secs, "Job stored");
        Ok(())
    }

    async fn count(&self) -> Result<u64, QueueError> {
        Ok(self.store.count(&self.name).await?)
    }

    async fn pop_job(&self) -> Result<Option<JobEnvelope>, QueueError> {
        let now = self.clock.now();
        let Some(record) = self
            .store
            .claim_next(&self.name, now, self.stale_before(now))
            .await?
        else {
            return Ok(None);
        };
        let claim = record.claim().ok_or_else(|| {
            StoreError::Backend(format!("claimed row {} has no reservation", record.id))
        })?;

        match JobEnvelope::from_json(&record.job_data) {
            Ok(mut envelope) => {
                envelope.attempts = record.attempts;
                envelope.max_attempts = record.max_attempts;
                envelope.claim = Some(claim);
                Ok(Some(envelope))
            }
            Err(e) => {
                // Retire the row so a corrupt payload cannot crash-loop every worker
                error!(row_id = record.id, job_id = %record.job_id, queue = %self.name, error = %e, "Malformed job payload, marking row as failed");
                self.store
                    .fail(&claim, &format!("malformed job payload: {e}"), now)
                    .await?;
                Err(QueueError::Serialization(e))
            }
        }
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let removed = self.store.clear(&self.name).await?;
        debug!(queue = %self.name, removed, "Queue cleared");
        Ok(())
    }

    async fn complete(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let claim = Self::claim(envelope)?;
        if !self.store.complete(&claim, self.clock.now()).await? {
            self.lost_claim(&claim, "complete");
        }
        Ok(())
    }

    async fn release(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let claim = Self::claim(envelope)?;
        if self.store.release_unattempted(&claim).await? {
            debug!(job_id = %claim.job_id, queue = %self.name, "Job handed back unattempted");
        } else {
            self.lost_claim(&claim, "release");
        }
        Ok(())
    }

    async fn fail(
        &self,
        envelope: &JobEnvelope,
        reason: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        let claim = Self::claim(envelope)?;
        let now = self.clock.now();

        if retryable && envelope.has_attempts_left() {
            if self.store.release(&claim, now).await? {
                debug!(job_id = %envelope.job_id, attempt = envelope.attempts, queue = %self.name, "Releasing job for retry");
            } else {
                self.lost_claim(&claim, "retry");
            }
        } else if self.store.fail(&claim, reason, now).await? {
            warn!(
                job_id = %envelope.job_id,
                job_type = %envelope.job_type,
                attempts = envelope.attempts,
                reason = %reason,
                "Job terminally failed"
            );
        } else {
            self.lost_claim(&claim, "fail");
        }

        Ok(())
    }
}
