//! Worker loop: pop, resolve handler, execute, record the outcome

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::backend::{Queue, QueueError, DEFAULT_QUEUE};
use crate::job::{JobEnvelope, JobId, JobResult};
use crate::service::QueueService;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume, `default` resolves to the default queue
    pub queue: String,
    /// Stop after this many jobs have been processed
    pub max_jobs: Option<u64>,
    /// Stop once this much time has passed
    pub max_runtime: Option<Duration>,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Stop as soon as a poll finds the queue empty
    pub stop_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_jobs: None,
            max_runtime: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_when_empty: false,
        }
    }
}

impl WorkerConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    pub fn max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn stop_when_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Handling,
    Succeeded,
    Failed,
    Stopped,
}

/// What happened to a single job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { job_id: JobId },
    Failed { job_id: JobId, reason: String, retryable: bool },
}

/// Totals for one call to [`QueueWorker::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Cooperative stop signal, checked between jobs
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumes one queue. The worker never retries on its own: a failed job is
/// handed back to the queue, whose attempt bookkeeping decides its fate.
pub struct QueueWorker {
    service: Arc<QueueService>,
    config: WorkerConfig,
    state: WorkerState,
    stop: StopHandle,
}

impl QueueWorker {
    pub fn new(service: Arc<QueueService>, config: WorkerConfig) -> Self {
        Self {
            service,
            config,
            state: WorkerState::Idle,
            stop: StopHandle::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn transition(&mut self, next: WorkerState) {
        trace!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    /// Run until a configured bound is hit or the stop handle fires.
    ///
    /// Job failures are absorbed. Only configuration problems (unknown queue,
    /// missing or mismatched handler) end the run with an error. A job popped
    /// without a usable handler is handed back without spending an attempt.
    pub async fn run(&mut self) -> Result<WorkerReport, QueueError> {
        let started = Instant::now();
        let mut report = WorkerReport::default();
        info!(queue = %self.config.queue, max_jobs = ?self.config.max_jobs, "Worker started");

        loop {
            if self.stop.is_stopped() {
                debug!("Stop requested, shutting down the worker…");
                break;
            }
            if self.config.max_jobs.is_some_and(|max| report.processed >= max) {
                debug!(processed = report.processed, "Job limit reached");
                break;
            }
            if self.config.max_runtime.is_some_and(|max| started.elapsed() >= max) {
                debug!("Runtime limit reached");
                break;
            }

            match self.run_once().await {
                Ok(Some(outcome)) => {
                    report.record(&outcome);
                    self.transition(WorkerState::Idle);
                }
                Ok(None) if self.config.stop_when_empty => {
                    debug!("No pending jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    trace!(
                        "No pending jobs found. Polling again in {:?}…",
                        self.config.poll_interval
                    );
                    sleep(self.config.poll_interval).await;
                }
                Err(e) if e.is_configuration() => {
                    error!(error = %e, "Worker configuration error");
                    self.transition(WorkerState::Stopped);
                    return Err(e);
                }
                Err(QueueError::Serialization(e)) => {
                    error!(error = %e, "Skipping undecodable job");
                    self.transition(WorkerState::Idle);
                }
                Err(e) => {
                    error!(error = %e, "Queue error");
                    self.transition(WorkerState::Idle);
                    sleep(self.config.poll_interval).await;
                }
            }
        }

        self.transition(WorkerState::Stopped);
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "Worker stopped"
        );
        Ok(report)
    }

    /// Process the next job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(outcome))` if a job was handled
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the job could not be fetched or routed
    pub async fn run_once(&mut self) -> Result<Option<JobOutcome>, QueueError> {
        self.transition(WorkerState::Fetching);
        let queue = self.service.get(&self.config.queue)?;

        let Some(envelope) = queue.pop_job().await? else {
            self.transition(WorkerState::Idle);
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            job_name = %envelope.job_name,
            queue = %queue.name(),
            attempt = envelope.attempts,
        );
        self.handle(queue, envelope).instrument(span).await.map(Some)
    }

    async fn handle(
        &mut self,
        queue: Arc<dyn Queue>,
        envelope: JobEnvelope,
    ) -> Result<JobOutcome, QueueError> {
        self.transition(WorkerState::Handling);

        let handler = match self.service.get_job_handler(&envelope) {
            Ok(handler) => handler,
            Err(e) => {
                // Hand the job back untouched for a correctly configured worker
                if let Err(release_err) = queue.release(&envelope).await {
                    warn!(error = %release_err, "Failed to release unroutable job");
                }
                self.transition(WorkerState::Failed);
                return Err(e);
            }
        };

        debug!("Running job…");
        let result = AssertUnwindSafe(handler.handle_envelope(&envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| JobResult::Retry(panic_message(&*panic)));

        let job_id = envelope.job_id;
        let outcome = match result {
            JobResult::Success => {
                queue.complete(&envelope).await?;
                debug!("Job succeeded");
                JobOutcome::Succeeded { job_id }
            }
            JobResult::Retry(reason) => {
                warn!(reason = %reason, "Job attempt failed");
                queue.fail(&envelope, &reason, true).await?;
                JobOutcome::Failed { job_id, reason, retryable: true }
            }
            JobResult::Fatal(reason) => {
                warn!(reason = %reason, "Job failed permanently");
                queue.fail(&envelope, &reason, false).await?;
                JobOutcome::Failed { job_id, reason, retryable: false }
            }
        };

        self.transition(match outcome {
            JobOutcome::Succeeded { .. } => WorkerState::Succeeded,
            JobOutcome::Failed { .. } => WorkerState::Failed,
        });
        Ok(outcome)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("job panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("job panicked: {msg}")
    } else {
        "job panicked".to_string()
    }
}
