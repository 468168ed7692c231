//! Retry engine: turns execution outcomes into state transitions.
//!
//! Success completes the job; a retryable failure reschedules it with
//! exponential backoff; exhaustion dead-letters it and fails its downstream
//! closure. Every path closes the attempt's execution row, publishes the
//! lifecycle event, announces terminal finishes on the recently-completed
//! side channel, and returns the ledger allocation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::dlq::{DeadLetterEntry, DeadLetterSink};
use crate::events::{EventBus, JobEvent};
use crate::job::{ExecutionStatus, Job, JobStatus, LogLevel};
use crate::queue::ReadyQueue;
use crate::resolver::DependencyResolver;
use crate::store::{StateStore, StatusPatch};
use crate::worker::{FinishedJob, Outcome};

/// Pacing for reschedules.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `min(base · multiplier^attempt, max)`, where `attempt` is the
    /// 0-based counter of the attempt that just failed.
    pub fn delay_for(&self, multiplier: f64, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Decides reschedule-with-backoff vs permanent failure and applies the
/// decision across store, queue, dead-letter sink and event bus.
pub struct RetryEngine {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ReadyQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    resolver: Arc<DependencyResolver>,
    bus: EventBus,
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn ReadyQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        resolver: Arc<DependencyResolver>,
        bus: EventBus,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            dead_letters,
            resolver,
            bus,
            policy,
        }
    }

    /// Settle one finished attempt. The ledger allocation recorded at
    /// admission is released here, exactly once, whatever the outcome.
    pub async fn handle_outcome(&self, finished: FinishedJob) -> Result<()> {
        let FinishedJob {
            job,
            execution_id,
            cpu_units,
            memory_mb,
            outcome,
        } = finished;
        let now = Utc::now();

        let result = match outcome {
            Outcome::Success(value) => self.handle_success(&job, execution_id, value, now).await,
            Outcome::Failure { message, traceback } => {
                self.handle_failure(&job, execution_id, &message, traceback.as_deref(), false, now)
                    .await
            }
            Outcome::Timeout => {
                self.handle_failure(&job, execution_id, "Job timed out", None, true, now)
                    .await
            }
        };

        self.queue.release(cpu_units, memory_mb).await?;
        result
    }

    async fn handle_success(
        &self,
        job: &Job,
        execution_id: uuid::Uuid,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .finish_execution(
                execution_id,
                ExecutionStatus::Completed,
                now,
                None,
                None,
                Some(&result),
            )
            .await?;
        self.store
            .set_status(job.id, JobStatus::Completed, StatusPatch::result(result.clone()))
            .await?;
        self.store
            .append_log(
                job.id,
                LogLevel::Info,
                "Job completed successfully",
                "scheduler",
            )
            .await?;

        // Announce completion so the dispatcher promotes direct dependents.
        self.queue.publish_completed(job.id).await?;
        self.bus.emit(JobEvent::Completed {
            job_id: job.id,
            result,
            timestamp: now,
        });
        info!(job_id = %job.id, job_type = %job.job_type, "job completed");
        Ok(())
    }

    async fn handle_failure(
        &self,
        job: &Job,
        execution_id: uuid::Uuid,
        message: &str,
        traceback: Option<&str>,
        timed_out: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let execution_status = if timed_out {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };
        self.store
            .finish_execution(
                execution_id,
                execution_status,
                now,
                Some(message),
                traceback,
                None,
            )
            .await?;

        let next_attempt = job.current_attempt + 1;
        if next_attempt < job.max_attempts {
            self.reschedule(job, message, next_attempt, now).await
        } else {
            self.fail_permanently(job, message, timed_out, now).await
        }
    }

    async fn reschedule(
        &self,
        job: &Job,
        message: &str,
        next_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let delay = self
            .policy
            .delay_for(job.backoff_multiplier, job.current_attempt);
        let retry_at = now + chrono::Duration::from_std(delay)?;

        self.store
            .set_status(
                job.id,
                JobStatus::Pending,
                StatusPatch {
                    current_attempt: Some(next_attempt),
                    next_retry_at: Some(retry_at),
                    error_message: Some(message.to_string()),
                    result: None,
                },
            )
            .await?;
        self.store
            .append_log(
                job.id,
                LogLevel::Warning,
                &format!(
                    "Job failed, will retry in {} seconds (attempt {}/{})",
                    delay.as_secs(),
                    next_attempt,
                    job.max_attempts
                ),
                "scheduler",
            )
            .await?;

        self.bus.emit(JobEvent::RetryScheduled {
            job_id: job.id,
            attempt: next_attempt,
            max_attempts: job.max_attempts,
            retry_at,
            error: message.to_string(),
            timestamp: now,
        });
        warn!(
            job_id = %job.id,
            attempt = next_attempt,
            max_attempts = job.max_attempts,
            delay_secs = delay.as_secs(),
            "job failed, retry scheduled"
        );
        Ok(())
    }

    async fn fail_permanently(
        &self,
        job: &Job,
        message: &str,
        timed_out: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (status, final_message) = if timed_out {
            (JobStatus::Timeout, "Job timed out permanently".to_string())
        } else {
            (JobStatus::Failed, message.to_string())
        };

        self.store
            .set_status(
                job.id,
                status,
                StatusPatch {
                    // Pin the counter to the limit: "attempts = max" holds in
                    // the dead-letter entry and the invariant check.
                    current_attempt: Some(job.max_attempts),
                    next_retry_at: None,
                    error_message: Some(final_message.clone()),
                    result: None,
                },
            )
            .await?;
        self.dead_letters
            .enqueue(DeadLetterEntry::for_job(job, final_message.clone(), now))
            .await?;
        self.store
            .append_log(
                job.id,
                LogLevel::Error,
                &format!(
                    "Job failed permanently after {} attempts: {final_message}",
                    job.max_attempts
                ),
                "scheduler",
            )
            .await?;

        // Downstream jobs can never become ready now.
        self.resolver.fail_dependents_of(job.id).await?;

        // Publish so the blocked → failed cascade is observed by the
        // promotion path as well.
        self.queue.publish_completed(job.id).await?;
        self.bus.emit(JobEvent::Failed {
            job_id: job.id,
            error: final_message.clone(),
            final_attempt: true,
            timestamp: now,
        });
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.max_attempts,
            error = %final_message,
            "job failed permanently"
        );
        Ok(())
    }
}
