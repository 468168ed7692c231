//! Admission and query service: the operations the API surface calls.
//!
//! The admission path is strict: validation runs before anything is
//! persisted, unknown dependencies and out-of-range fields reject the
//! request, and an idempotency-key hit returns the prior job unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::dlq::{DeadLetterEntry, DeadLetterSink, DlqStats};
use crate::error::QueueError;
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobSpec, JobStatus, LogEntry, LogLevel};
use crate::queue::{QueueHandle, ReadyQueue, ResourceSnapshot};
use crate::resolver::DependencyResolver;
use crate::store::{CreateOutcome, JobFilter, StateStore, StatusPatch};

/// A job plus its place among waiting work (only while non-terminal).
#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: Job,
    pub position_in_queue: Option<u64>,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub details: JobDetails,
    /// False when an idempotency key matched an existing job.
    pub created: bool,
}

/// Counts and rates for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub job_counts: HashMap<String, u64>,
    pub success_rate_percent: f64,
    pub dead_letter: DlqStats,
    pub currently_running: u64,
    pub waiting_jobs: u64,
    pub resources: ResourceSnapshot,
    pub queue_depths: HashMap<String, u64>,
}

/// Component reachability for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: &'static str,
    pub database: bool,
    pub queue_store: bool,
    pub dead_letter_store: bool,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.database && self.queue_store && self.dead_letter_store
    }
}

/// Front door of the engine: submit, query, cancel, dead-letter admin.
pub struct AdmissionService {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ReadyQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    resolver: Arc<DependencyResolver>,
    bus: EventBus,
}

impl AdmissionService {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn ReadyQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        resolver: Arc<DependencyResolver>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            dead_letters,
            resolver,
            bus,
        }
    }

    /// Admit a job: validate, dedupe, persist, wire dependencies, and make
    /// it Ready (enqueued) or Blocked.
    pub async fn submit(&self, spec: JobSpec) -> Result<SubmittedJob, QueueError> {
        spec.validate()?;

        // Dependencies must exist before anything is written.
        let mut parents: Vec<Uuid> = spec.depends_on.clone();
        parents.sort_unstable();
        parents.dedup();
        for parent in &parents {
            if self.store.get_job(*parent).await?.is_none() {
                return Err(QueueError::UnknownDependency(*parent));
            }
        }

        let job = match self.store.create_job(&spec).await? {
            CreateOutcome::Duplicate(existing) => {
                let position = self.position_for(&existing).await?;
                return Ok(SubmittedJob {
                    details: JobDetails {
                        job: existing,
                        position_in_queue: position,
                    },
                    created: false,
                });
            }
            CreateOutcome::Created(job) => job,
        };

        for parent in &parents {
            self.store.add_dependency(*parent, job.id).await?;
        }

        // A job whose parents are already all Completed skips Blocked.
        let satisfied = parents.is_empty() || self.resolver.are_parents_satisfied(job.id).await?;
        if satisfied {
            self.store
                .set_status(job.id, JobStatus::Ready, StatusPatch::default())
                .await?;
            self.queue.push(QueueHandle::for_job(&job)).await?;
        } else {
            self.store
                .set_status(job.id, JobStatus::Blocked, StatusPatch::default())
                .await?;
        }

        self.store
            .append_log(
                job.id,
                LogLevel::Info,
                &format!(
                    "Job created with type '{}' and priority '{}'",
                    job.job_type, job.priority
                ),
                "admission",
            )
            .await?;
        self.bus.emit(JobEvent::Created {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            timestamp: Utc::now(),
        });
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            blocked = !satisfied,
            "job admitted"
        );

        let job = self
            .store
            .get_job(job.id)
            .await?
            .ok_or(QueueError::NotFound(job.id))?;
        let position = self.position_for(&job).await?;
        Ok(SubmittedJob {
            details: JobDetails {
                job,
                position_in_queue: position,
            },
            created: true,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<JobDetails, QueueError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        let position = self.position_for(&job).await?;
        Ok(JobDetails {
            job,
            position_in_queue: position,
        })
    }

    /// Page through jobs, newest first. Returns details plus the total row
    /// count for the filter.
    pub async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<JobDetails>, u64), QueueError> {
        if page < 1 {
            return Err(QueueError::Validation("page must be >= 1".into()));
        }
        if !(1..=100).contains(&per_page) {
            return Err(QueueError::Validation("per_page must be within 1..=100".into()));
        }

        let (jobs, total) = self.store.list_jobs(filter, page, per_page).await?;
        let details = futures::future::try_join_all(jobs.into_iter().map(|job| async move {
            let position = self.position_for(&job).await?;
            Ok::<_, QueueError>(JobDetails {
                job,
                position_in_queue: position,
            })
        }))
        .await?;
        Ok((details, total))
    }

    /// Cancel a waiting job. Running and terminal jobs are rejected with
    /// state-specific wording.
    pub async fn cancel(&self, id: Uuid) -> Result<(), QueueError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        if !job.status.is_cancellable() {
            return Err(QueueError::cancel_conflict(job.status));
        }

        self.store
            .set_status(id, JobStatus::Cancelled, StatusPatch::default())
            .await?;
        self.store
            .append_log(id, LogLevel::Info, "Job cancelled by user request", "admission")
            .await?;
        self.bus.emit(JobEvent::Cancelled {
            job_id: id,
            timestamp: Utc::now(),
        });
        info!(job_id = %id, "job cancelled");
        Ok(())
    }

    /// Audit log, newest first.
    pub async fn logs(&self, id: Uuid) -> Result<Vec<LogEntry>, QueueError> {
        if self.store.get_job(id).await?.is_none() {
            return Err(QueueError::NotFound(id));
        }
        Ok(self.store.logs_for(id).await?)
    }

    /// Record a dependency edge between existing jobs, rejecting cycles.
    pub async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<(), QueueError> {
        for id in [parent, child] {
            if self.store.get_job(id).await?.is_none() {
                return Err(QueueError::UnknownDependency(id));
            }
        }
        self.resolver.add_dependency(parent, child).await
    }

    // ---- Dead-letter admin ----------------------------------------------

    pub async fn dead_letter_list(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<DeadLetterEntry>, u64), QueueError> {
        let entries = self.dead_letters.list(offset, limit).await?;
        let total = self.dead_letters.count().await?;
        Ok((entries, total))
    }

    pub async fn dead_letter_stats(&self) -> Result<(DlqStats, Vec<DeadLetterEntry>), QueueError> {
        let stats = self.dead_letters.stats().await?;
        let recent = self.dead_letters.recent(5).await?;
        Ok((stats, recent))
    }

    /// Pull an entry out of the sink and resubmit it as a brand-new job
    /// with default priority and retry budget.
    pub async fn retry_from_dead_letter(&self, job_id: Uuid) -> Result<SubmittedJob, QueueError> {
        let entry = self
            .dead_letters
            .remove_one(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;

        let spec = JobSpec::new(entry.job_type).payload(entry.payload);
        let submitted = self.submit(spec).await?;
        info!(
            original_job_id = %job_id,
            new_job_id = %submitted.details.job.id,
            "job resubmitted from dead letter queue"
        );
        Ok(submitted)
    }

    pub async fn clear_dead_letters(&self, job_type: Option<&str>) -> Result<u64, QueueError> {
        Ok(self.dead_letters.clear(job_type).await?)
    }

    // ---- Admin rollups ---------------------------------------------------

    pub async fn metrics(&self) -> Result<SystemMetrics, QueueError> {
        let counts = self.store.count_by_status().await?;
        let completed = *counts.get(&JobStatus::Completed).unwrap_or(&0);
        let failed = *counts.get(&JobStatus::Failed).unwrap_or(&0);
        let finished = completed + failed;
        let success_rate = if finished > 0 {
            (completed as f64 / finished as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        let job_counts = counts
            .iter()
            .map(|(status, count)| (status.as_str().to_string(), *count))
            .collect();
        let queue_depths = self
            .queue
            .queue_depths()
            .await?
            .into_iter()
            .map(|(priority, depth)| (priority.as_str().to_string(), depth))
            .collect();

        Ok(SystemMetrics {
            job_counts,
            success_rate_percent: success_rate,
            dead_letter: self.dead_letters.stats().await?,
            currently_running: *counts.get(&JobStatus::Running).unwrap_or(&0),
            waiting_jobs: *counts.get(&JobStatus::Pending).unwrap_or(&0)
                + *counts.get(&JobStatus::Ready).unwrap_or(&0),
            resources: self.queue.resources().await?,
            queue_depths,
        })
    }

    pub async fn health(&self) -> SystemHealth {
        let database = self.store.ping().await.is_ok();
        let queue_store = self.queue.ping().await.is_ok();
        let dead_letter_store = self.dead_letters.ping().await.is_ok();
        SystemHealth {
            status: if database && queue_store && dead_letter_store {
                "healthy"
            } else {
                "degraded"
            },
            database,
            queue_store,
            dead_letter_store,
        }
    }

    async fn position_for(&self, job: &Job) -> Result<Option<u64>, QueueError> {
        if job.status.is_terminal() || job.status == JobStatus::Running {
            return Ok(None);
        }
        Ok(Some(self.store.queue_position(job).await?))
    }
}
