//! # Ferry Queue
//!
//! Asynchronous job queue and worker subsystem.
//!
//! Features:
//! - Typed `Job` payloads in a type-tagged JSON envelope
//! - Pluggable queues (in-memory, or any `JobStore` via `DatabaseQueue`)
//! - Named-queue registry and handler registry in `QueueService`
//! - Bounded worker loop with at-least-once delivery
//! - Generic retry runner with constant backoff

pub mod backend;
pub mod clock;
pub mod database;
pub mod handler;
pub mod job;
pub mod jobs;
pub mod memory;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

pub use backend::{Queue, QueueError, DEFAULT_QUEUE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::DatabaseQueue;
pub use handler::{ErasedHandler, HandlerAdapter, JobHandler};
pub use job::{Job, JobContext, JobEnvelope, JobId, JobResult, DEFAULT_MAX_ATTEMPTS};
pub use memory::MemoryQueue;
pub use retry::{RetryConfigError, RetryRunner};
pub use service::{DispatchOptions, QueueService};
pub use store::{
    Claim, JobRecord, JobStore, MemoryJobStore, NewJobRecord, StoreError, EXPIRED_FINAL_ATTEMPT,
};
pub use task::{Task, TaskError, TaskRegistry};
pub use worker::{JobOutcome, QueueWorker, StopHandle, WorkerConfig, WorkerReport, WorkerState};
