//! Job definitions

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::store::Claim;

/// Job Identifier
pub type JobId = Uuid;

/// Default number of attempts before a job is terminally failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A unit of deferred work.
///
/// Implementors are plain data. The fields are the payload, and execution
/// lives in a [`JobHandler`](crate::handler::JobHandler) registered for the
/// type. The job id is not part of the payload: it is assigned at dispatch
/// time and travels on the [`JobEnvelope`].
pub trait Job: Serialize + DeserializeOwned + Send + Sync + Debug + 'static {
    /// Type tag stored alongside the payload.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Human readable name, used in logs and diagnostics
    fn job_name(&self) -> String {
        Self::JOB_TYPE.to_string()
    }
}

/// Type-tagged wire form of a dispatched job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub job_type: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    /// Number of times the job has been claimed by a worker
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch seconds
    pub created_at: i64,
    /// Reservation held by the worker that popped this job from a store
    #[serde(skip)]
    pub claim: Option<Claim>,
}

impl JobEnvelope {
    /// Wrap a job under a fresh id
    pub fn new<J: Job>(job: &J, max_attempts: u32, created_at: i64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_id: Uuid::new_v4(),
            job_type: J::JOB_TYPE.to_string(),
            job_name: job.job_name(),
            payload: serde_json::to_value(job)?,
            attempts: 0,
            max_attempts,
            created_at,
            claim: None,
        })
    }

    /// Decode the payload back into its concrete job type
    pub fn decode<J: Job>(&self) -> Result<J, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Whether another claim is allowed after the current one
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            job_id: self.job_id,
            job_name: self.job_name.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        }
    }
}

/// Per-invocation metadata handed to a handler alongside the job
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job succeeded
    Success,
    /// Job failed but should retry
    Retry(String),
    /// Job failed permanently
    Fatal(String),
}

impl<E: std::fmt::Display> From<Result<(), E>> for JobResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Retry(e.to_string()),
        }
    }
}
