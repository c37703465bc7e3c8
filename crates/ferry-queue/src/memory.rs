//! In-memory queue implementation with lazy delayed-job promotion
//!
//! Process-local and volatile. Intended for development and tests only: it
//! must never be shared between worker processes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{Queue, QueueError};
use crate::clock::{Clock, SystemClock};
use crate::job::JobEnvelope;

#[derive(Debug, Default)]
struct MemoryState {
    /// Available jobs. New entries go to the front, pops come off the back.
    now: VecDeque<String>,
    /// `(due_at, job)` pairs not yet promoted into `now`
    delayed: Vec<(i64, String)>,
    last_check: Option<i64>,
}

impl MemoryState {
    /// Promote due delayed jobs, at most once per clock tick
    fn promote_due(&mut self, now: i64) {
        if self.last_check.is_some_and(|last| now <= last) {
            return;
        }
        self.last_check = Some(now);

        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(due_at, _)| *due_at <= now);
        self.delayed = pending;

        // Stable sort keeps dispatch order among equal due times
        due.sort_by_key(|(due_at, _)| *due_at);
        for (_, job) in due {
            self.now.push_front(job);
        }
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, envelope: JobEnvelope, delay_secs: u64) -> Result<(), QueueError> {
        let data = envelope.to_json()?;
        let mut state = self.state.lock().await;

        if delay_secs == 0 {
            state.now.push_front(data);
        } else {
            let due_at = self.clock.now().saturating_add_unsigned(delay_secs);
            state.delayed.push((due_at, data));
        }

        Ok(())
    }

    async fn count(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok((state.now.len() + state.delayed.len()) as u64)
    }

    async fn pop_job(&self) -> Result<Option<JobEnvelope>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        let Some(data) = state.now.pop_back() else {
            return Ok(None);
        };
        drop(state);

        let mut envelope = JobEnvelope::from_json(&data)?;
        envelope.attempts += 1;
        Ok(Some(envelope))
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.now.clear();
        state.delayed.clear();
        Ok(())
    }

    async fn release(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut returned = envelope.clone();
        returned.max_attempts = returned.max_attempts.saturating_add(1);
        let data = returned.to_json()?;

        // Back of the deque, so it is the next job popped
        self.state.lock().await.now.push_back(data);
        debug!(job_id = %envelope.job_id, queue = %self.name, "Job handed back unattempted");
        Ok(())
    }

    async fn fail(
        &self,
        envelope: &JobEnvelope,
        reason: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        if retryable && envelope.has_attempts_left() {
            debug!(
                job_id = %envelope.job_id,
                attempt = envelope.attempts,
                queue = %self.name,
                "Re-queuing failed job"
            );
            return self.dispatch(envelope.clone(), 0).await;
        }

        warn!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            attempts = envelope.attempts,
            reason = %reason,
            "Dropping terminally failed job from memory queue"
        );
        Ok(())
    }
}
