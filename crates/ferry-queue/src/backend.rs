//! Queue Backend Trait

use async_trait::async_trait;

use crate::job::{JobEnvelope, JobId};
use crate::store::StoreError;

/// Name reserved for the queue flagged as default
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{0}' is already registered")]
    QueueAlreadyRegistered(String),
    #[error("Queue name 'default' is reserved for the default queue")]
    ReservedQueueName,
    #[error("Queue '{0}' is not registered")]
    QueueNotFound(String),
    #[error("No default queue has been registered")]
    NoDefaultQueue,
    #[error("A job handler is already registered for job type '{0}'")]
    HandlerAlreadyRegistered(String),
    #[error("No handler registered for job type '{0}'")]
    NoHandlerRegistered(String),
    #[error("Handler registered for '{job_type}' is not a valid job handler (it handles '{handles}')")]
    InvalidJobHandler { job_type: String, handles: String },
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error("Job {0} carries no reservation from this queue")]
    NotClaimed(JobId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Wiring and lookup failures, as opposed to runtime backend problems
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::Serialization(_) | Self::Store(_))
    }
}

/// Holding area for jobs awaiting a worker
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a job, available after `delay_secs`
    async fn dispatch(&self, envelope: JobEnvelope, delay_secs: u64) -> Result<(), QueueError>;

    /// Number of jobs not yet retired, delayed ones included
    async fn count(&self) -> Result<u64, QueueError>;

    /// Claim the next available job
    async fn pop_job(&self) -> Result<Option<JobEnvelope>, QueueError>;

    /// Drop every job held by this queue
    async fn clear(&self) -> Result<(), QueueError>;

    /// Record that a popped job was handled successfully
    async fn complete(&self, _envelope: &JobEnvelope) -> Result<(), QueueError> {
        Ok(())
    }

    /// Hand a popped job back without spending the attempt it was popped with
    async fn release(&self, _envelope: &JobEnvelope) -> Result<(), QueueError> {
        Ok(())
    }

    /// Record a failed attempt.
    /// `retryable` is false for fatal failures, which must not be attempted again.
    async fn fail(
        &self,
        _envelope: &JobEnvelope,
        _reason: &str,
        _retryable: bool,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}
