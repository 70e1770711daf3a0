//! Worker loop for one queue.
//!
//! Each runner polls its queue, keeps up to `concurrency` jobs in flight,
//! and applies the ack/retry/exhaust protocol around a [`JobHandler`].
//! Handlers never touch the queue directly: returning `Err` is the retry
//! signal, and `exhausted` fires exactly once when the budget is spent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::{Job, JobQueue};

/// Failure of one job execution; the message lands in `last_error`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(error: sqlx::Error) -> Self {
        JobError::new(format!("database: {error}"))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        JobError::new(format!("payload: {error}"))
    }
}

impl From<crate::provider::ProviderError> for JobError {
    fn from(error: crate::provider::ProviderError) -> Self {
        JobError::new(error.to_string())
    }
}

/// What a queue consumer implements.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process one claimed job. `Err` reschedules it per the backoff policy
    /// until the attempts budget runs out.
    async fn run(&self, job: &Job) -> Result<(), JobError>;

    /// Called once when the final attempt has failed, before the job row is
    /// removed from its queue.
    async fn exhausted(&self, _job: &Job, _error: &JobError) {}
}

/// Polling consumer for one named queue.
pub struct JobRunner {
    queue_name: &'static str,
    queue: JobQueue,
    concurrency: usize,
    poll_interval: Duration,
}

impl JobRunner {
    pub fn new(queue_name: &'static str, queue: JobQueue, concurrency: usize) -> Self {
        Self {
            queue_name,
            queue,
            concurrency,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Spawn the polling loop onto `tracker`; it drains in-flight jobs and
    /// exits when `cancel` fires.
    pub fn spawn<H: JobHandler>(self, handler: Arc<H>, cancel: CancellationToken, tracker: &TaskTracker) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let inner_tracker = tracker.clone();
        tracker.spawn(async move {
            tracing::info!(queue = self.queue_name, concurrency = self.concurrency, "worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                let free = semaphore.available_permits();
                if free == 0 {
                    continue;
                }
                let jobs = match self.queue.claim(self.queue_name, free as i64).await {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        tracing::error!(queue = self.queue_name, %error, "claim failed");
                        continue;
                    }
                };

                for job in jobs {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    let queue = self.queue.clone();
                    let handler = handler.clone();
                    let queue_name = self.queue_name;
                    inner_tracker.spawn(async move {
                        let _permit = permit;
                        process_one(queue_name, &queue, handler.as_ref(), job).await;
                    });
                }
            }
            tracing::info!(queue = self.queue_name, "worker stopped");
        });
    }
}

#[tracing::instrument(skip_all, fields(queue = queue_name, job_id = job.id, attempt = job.attempts))]
async fn process_one<H: JobHandler + ?Sized>(
    queue_name: &'static str,
    queue: &JobQueue,
    handler: &H,
    job: Job,
) {
    match handler.run(&job).await {
        Ok(()) => {
            if let Err(error) = queue.complete(job.id).await {
                // The job will be redelivered after the visibility timeout;
                // handlers are idempotent so this only costs a duplicate run.
                tracing::error!(%error, "ack failed");
            }
        }
        Err(job_error) => {
            if job.budget_exhausted() {
                tracing::warn!(error = %job_error, "retry budget exhausted");
                handler.exhausted(&job, &job_error).await;
                if let Err(error) = queue.complete(job.id).await {
                    tracing::error!(%error, "failed to drop exhausted job");
                }
            } else {
                tracing::warn!(error = %job_error, "job failed, scheduling retry");
                if let Err(error) = queue.retry_later(&job, &job_error.message).await {
                    tracing::error!(%error, "failed to schedule retry");
                }
            }
        }
    }
}
