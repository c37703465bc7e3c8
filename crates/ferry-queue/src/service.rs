//! Queue registry, handler registry and the public dispatch API

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::backend::{Queue, QueueError, DEFAULT_QUEUE};
use crate::clock::{Clock, SystemClock};
use crate::handler::{ErasedHandler, HandlerAdapter, JobHandler};
use crate::job::{Job, JobEnvelope, JobId, DEFAULT_MAX_ATTEMPTS};

/// Where and how a job is dispatched
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub queue: String,
    pub delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            delay_secs: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DispatchOptions {
    pub fn on(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn delay(mut self, delay_secs: u64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Named queues plus the job-type to handler mapping.
///
/// Registration happens once while the application is wired up; afterwards
/// the service is shared behind an `Arc`.
pub struct QueueService {
    queues: BTreeMap<String, Arc<dyn Queue>>,
    default_queue: Option<String>,
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("default_queue", &self.default_queue)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for QueueService {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: BTreeMap::new(),
            default_queue: None,
            handlers: HashMap::new(),
            clock,
        }
    }

    /// Register a queue under its own name.
    ///
    /// Fails without touching the registry if the name is taken or is the
    /// reserved `default`.
    pub fn register_queue(&mut self, queue: Arc<dyn Queue>, is_default: bool) -> Result<(), QueueError> {
        let name = queue.name().to_string();

        if name == DEFAULT_QUEUE {
            return Err(QueueError::ReservedQueueName);
        }
        if self.queues.contains_key(&name) {
            return Err(QueueError::QueueAlreadyRegistered(name));
        }
        if is_default {
            if let Some(existing) = &self.default_queue {
                return Err(QueueError::QueueAlreadyRegistered(format!(
                    "{DEFAULT_QUEUE} (currently '{existing}')"
                )));
            }
            self.default_queue = Some(name.clone());
        }

        info!(queue = %name, default = is_default, "Queue registered");
        self.queues.insert(name, queue);
        Ok(())
    }

    /// Resolve a queue by name. `default` resolves to the flagged default queue.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Queue>, QueueError> {
        if name == DEFAULT_QUEUE {
            return self.default_queue();
        }
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    pub fn default_queue(&self) -> Result<Arc<dyn Queue>, QueueError> {
        let name = self.default_queue.as_deref().ok_or(QueueError::NoDefaultQueue)?;
        self.get(name)
    }

    pub fn default_queue_name(&self) -> Option<&str> {
        self.default_queue.as_deref()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Dispatch to the default queue with default options
    pub async fn dispatch<J: Job>(&self, job: &J) -> Result<JobId, QueueError> {
        self.dispatch_with(job, DispatchOptions::default()).await
    }

    /// Assign a fresh job id and hand the job to the named queue
    #[instrument(name = "queue.dispatch", skip(self, job), fields(job_type = J::JOB_TYPE, queue = %options.queue))]
    pub async fn dispatch_with<J: Job>(&self, job: &J, options: DispatchOptions) -> Result<JobId, QueueError> {
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidMaxAttempts);
        }
        let queue = self.get(&options.queue)?;
        let envelope = JobEnvelope::new(job, options.max_attempts, self.clock.now())?;
        let job_id = envelope.job_id;

        queue.dispatch(envelope, options.delay_secs).await?;
        debug!(%job_id, delay_secs = options.delay_secs, "Job dispatched");
        Ok(job_id)
    }

    pub async fn pop_job(&self, queue_name: &str) -> Result<Option<JobEnvelope>, QueueError> {
        self.get(queue_name)?.pop_job().await
    }

    pub async fn count(&self, queue_name: &str) -> Result<u64, QueueError> {
        self.get(queue_name)?.count().await
    }

    pub async fn clear(&self, queue_name: &str) -> Result<(), QueueError> {
        self.get(queue_name)?.clear().await
    }

    /// Register the handler for job type `J`
    pub fn register_job_handler<J, H>(&mut self, handler: H) -> Result<(), QueueError>
    where
        J: Job,
        H: JobHandler<J>,
    {
        self.register_erased_handler(J::JOB_TYPE, Arc::new(HandlerAdapter::<J, H>::new(handler)))
    }

    /// Register a pre-built handler under an explicit job type tag
    pub fn register_erased_handler(
        &mut self,
        job_type: &str,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<(), QueueError> {
        if self.handlers.contains_key(job_type) {
            return Err(QueueError::HandlerAlreadyRegistered(job_type.to_string()));
        }

        debug!(job_type, "Job handler registered");
        self.handlers.insert(job_type.to_string(), handler);
        Ok(())
    }

    /// Resolve the handler for a popped job
    pub fn get_job_handler(&self, envelope: &JobEnvelope) -> Result<Arc<dyn ErasedHandler>, QueueError> {
        let handler = self
            .handlers
            .get(&envelope.job_type)
            .ok_or_else(|| QueueError::NoHandlerRegistered(envelope.job_type.clone()))?;

        if handler.job_type() != envelope.job_type {
            return Err(QueueError::InvalidJobHandler {
                job_type: envelope.job_type.clone(),
                handles: handler.job_type().to_string(),
            });
        }

        Ok(handler.clone())
    }
}
