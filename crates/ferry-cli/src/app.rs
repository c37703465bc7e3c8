//! Wires queues, handlers and tasks from the loaded configuration

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use ferry_persist::{PostgresJobStore, SqliteJobStore};
use ferry_queue::jobs::{
    DispatchEventHandler, DispatchEventJob, EventListener, EventListeners, LogMailer,
    SendMailHandler, SendMailJob,
};
use ferry_queue::{
    Clock, DatabaseQueue, JobStore, MemoryQueue, Queue, QueueService, SystemClock, Task,
    TaskRegistry,
};

use crate::config::{Backend, FerryConfig};

/// Listener name that writes events to the log
pub const LOG_LISTENER: &str = "log";

pub struct App {
    pub config: FerryConfig,
    pub service: Arc<QueueService>,
    pub tasks: TaskRegistry,
}

impl App {
    pub async fn build(config: FerryConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        let mut service = QueueService::new();

        for name in &config.queues {
            let queue: Arc<dyn Queue> = match (&store, config.stale_reservation) {
                (Some(store), Some(window)) => {
                    Arc::new(DatabaseQueue::new(name.clone(), store.clone(), window))
                }
                _ => Arc::new(MemoryQueue::new(name.clone())),
            };
            service
                .register_queue(queue, *name == config.default_queue)
                .with_context(|| format!("Failed to register queue '{name}'"))?;
        }

        service
            .register_job_handler::<SendMailJob, _>(SendMailHandler::new(Arc::new(LogMailer)))
            .context("Failed to register mail handler")?;
        service
            .register_job_handler::<DispatchEventJob, _>(DispatchEventHandler::new(
                EventListeners::new().with(LOG_LISTENER, Arc::new(LogListener)),
            ))
            .context("Failed to register event handler")?;

        let service = Arc::new(service);
        let mut tasks = TaskRegistry::new();
        tasks.register(Arc::new(QueueReportTask {
            service: service.clone(),
        }))?;
        if let Some(store) = &store {
            tasks.register(Arc::new(PruneCompletedTask {
                store: store.clone(),
                retention_secs: config.prune_after.as_secs(),
                clock: Arc::new(SystemClock),
            }))?;
        }

        info!(
            backend = config.backend.as_str(),
            queues = ?config.queues,
            default = %config.default_queue,
            "Ferry initialised"
        );

        Ok(Self {
            config,
            service,
            tasks,
        })
    }
}

async fn open_store(config: &FerryConfig) -> Result<Option<Arc<dyn JobStore>>> {
    let Some(store_config) = config.store_config() else {
        return Ok(None);
    };

    let store: Arc<dyn JobStore> = match config.backend {
        Backend::Sqlite => Arc::new(
            SqliteJobStore::connect_with_config(&store_config)
                .await
                .context("Failed to open SQLite job store")?,
        ),
        Backend::Postgres => Arc::new(
            PostgresJobStore::connect_with_config(&store_config)
                .await
                .context("Failed to open PostgreSQL job store")?,
        ),
        Backend::Memory => return Ok(None),
    };
    Ok(Some(store))
}

/// Event listener that only logs what it receives
struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    async fn on_event(&self, event: &serde_json::Value) -> Result<()> {
        info!(%event, "Event received");
        Ok(())
    }
}

/// Logs the pending count of every registered queue
struct QueueReportTask {
    service: Arc<QueueService>,
}

#[async_trait]
impl Task for QueueReportTask {
    fn name(&self) -> &str {
        "queue-report"
    }

    fn description(&self) -> &str {
        "Log the number of pending jobs per queue"
    }

    async fn run(&self) -> Result<()> {
        for name in self.service.queue_names() {
            let pending = self.service.count(&name).await?;
            info!(queue = %name, pending, "Queue size");
        }
        Ok(())
    }
}

/// Deletes completed rows older than the retention period
struct PruneCompletedTask {
    store: Arc<dyn JobStore>,
    retention_secs: u64,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Task for PruneCompletedTask {
    fn name(&self) -> &str {
        "prune-completed"
    }

    fn description(&self) -> &str {
        "Delete completed jobs older than FERRY_PRUNE_AFTER_SECS"
    }

    async fn run(&self) -> Result<()> {
        let before = self.clock.now().saturating_sub_unsigned(self.retention_secs);
        let removed = self.store.prune_completed(before).await?;
        info!(removed, before, "Pruned completed jobs");
        Ok(())
    }
}
