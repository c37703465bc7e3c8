//! Deferred event delivery to a named listener

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::JobHandler;
use crate::job::{Job, JobContext, JobResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEventJob {
    /// Name the listener was registered under
    pub listener: String,
    pub event: serde_json::Value,
}

impl Job for DispatchEventJob {
    const JOB_TYPE: &'static str = "dispatch_event";

    fn job_name(&self) -> String {
        format!("event:{}", self.listener)
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &serde_json::Value) -> anyhow::Result<()>;
}

/// Listener lookup for [`DispatchEventHandler`]
#[derive(Default, Clone)]
pub struct EventListeners {
    listeners: HashMap<String, Arc<dyn EventListener>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.insert(name.into(), listener);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn EventListener>> {
        self.listeners.get(name)
    }
}

pub struct DispatchEventHandler {
    listeners: EventListeners,
}

impl DispatchEventHandler {
    pub fn new(listeners: EventListeners) -> Self {
        Self { listeners }
    }
}

#[async_trait]
impl JobHandler<DispatchEventJob> for DispatchEventHandler {
    async fn handle(&self, job: DispatchEventJob, _ctx: &JobContext) -> JobResult {
        let Some(listener) = self.listeners.get(&job.listener) else {
            return JobResult::Fatal(format!("unknown event listener '{}'", job.listener));
        };

        match listener.on_event(&job.event).await {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Retry(format!("{e:#}")),
        }
    }
}
