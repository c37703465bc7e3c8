//! Named ad-hoc tasks, run through the [`RetryRunner`]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::retry::RetryRunner;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Task '{0}' not found")]
    NotFound(String),
    #[error("Task '{name}' failed after {attempts} attempt(s): {source}")]
    Failed {
        name: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn Task>) -> Result<(), TaskError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(TaskError::AlreadyRegistered(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Task>, TaskError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<dyn Task>> {
        self.tasks.values()
    }

    /// Run a registered task with bounded retries
    pub async fn run(&self, name: &str, runner: &RetryRunner) -> Result<(), TaskError> {
        let task = self.get(name)?;
        let task = task.as_ref();
        info!(task = name, max_attempts = runner.max_attempts(), "Running task");

        runner
            .run(move || task.run())
            .await
            .map_err(|source| TaskError::Failed {
                name: name.to_string(),
                attempts: runner.max_attempts(),
                source,
            })
    }
}
