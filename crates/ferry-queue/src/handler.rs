//! Job handlers and their type-erased form

use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::error;

use crate::job::{Job, JobContext, JobEnvelope, JobResult};

/// Execution strategy for exactly one job type.
///
/// Handlers are shared across many job instances, so they must not keep
/// per-job state between invocations.
#[async_trait]
pub trait JobHandler<J: Job>: Send + Sync + 'static {
    async fn handle(&self, job: J, ctx: &JobContext) -> JobResult;
}

/// Object-safe handler the worker invokes without knowing the job type
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    /// Type tag of the jobs this handler accepts
    fn job_type(&self) -> &str;

    async fn handle_envelope(&self, envelope: &JobEnvelope) -> JobResult;
}

/// Bridges a typed [`JobHandler`] to [`ErasedHandler`] by decoding the payload
pub struct HandlerAdapter<J, H> {
    handler: H,
    _job: PhantomData<fn() -> J>,
}

impl<J: Job, H: JobHandler<J>> HandlerAdapter<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _job: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, H: JobHandler<J>> ErasedHandler for HandlerAdapter<J, H> {
    fn job_type(&self) -> &str {
        J::JOB_TYPE
    }

    async fn handle_envelope(&self, envelope: &JobEnvelope) -> JobResult {
        let job = match envelope.decode::<J>() {
            Ok(job) => job,
            Err(e) => {
                // A payload that cannot be decoded will never succeed, so it is not retried
                error!(job_id = %envelope.job_id, job_type = %envelope.job_type, error = %e, "Job payload deserialization failed");
                return JobResult::Fatal(format!("malformed job payload: {e}"));
            }
        };

        self.handler.handle(job, &envelope.context()).await
    }
}
