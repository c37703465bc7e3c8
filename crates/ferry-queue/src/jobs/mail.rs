//! Outgoing mail job

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::handler::JobHandler;
use crate::job::{Job, JobContext, JobResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMailJob {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Job for SendMailJob {
    const JOB_TYPE: &'static str = "send_mail";

    fn job_name(&self) -> String {
        format!("mail:{}", self.subject)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Worth retrying, e.g. the relay was unreachable
    #[error("transient mail failure: {0}")]
    Transient(String),
    #[error("mail rejected: {0}")]
    Rejected(String),
}

/// Transport used by [`SendMailHandler`]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Mailer that only writes the message to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        info!(to, subject, body_len = body.len(), "Mail sent");
        Ok(())
    }
}

pub struct SendMailHandler {
    mailer: Arc<dyn Mailer>,
}

impl SendMailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler<SendMailJob> for SendMailHandler {
    async fn handle(&self, job: SendMailJob, _ctx: &JobContext) -> JobResult {
        if !job.to.contains('@') {
            return JobResult::Fatal(format!("invalid recipient '{}'", job.to));
        }

        match self.mailer.send(&job.to, &job.subject, &job.body).await {
            Ok(()) => JobResult::Success,
            Err(e @ MailError::Transient(_)) => JobResult::Retry(e.to_string()),
            Err(e @ MailError::Rejected(_)) => JobResult::Fatal(e.to_string()),
        }
    }
}
