//! Durable state store contract.
//!
//! The store is the single source of truth for jobs, dependency edges,
//! execution attempts and audit logs. Implementations must keep the §3
//! invariants: status writes atomically maintain `updated_at` (plus
//! `started_at` on Running and `completed_at` on any terminal state),
//! terminal statuses are sinks, and an idempotency key maps to exactly one
//! job id for all time.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::job::{ExecutionRecord, ExecutionStatus, Job, JobPriority, JobSpec, JobStatus, LogEntry, LogLevel};

/// Outcome of a create: a fresh row, or the prior row for a reused
/// idempotency key.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Job),
    /// Idempotency hit; the existing job is returned unchanged.
    Duplicate(Job),
}

impl CreateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Duplicate(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Fields written together with a status change.
///
/// `None` leaves the column untouched; the store never interprets `None` as
/// a clear.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub current_attempt: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
}

impl StatusPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }
}

/// Listing filters; all conjunctive. `job_type` matches as a
/// case-insensitive substring.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub job_type: Option<String>,
}

/// Opening half of an execution row; the attempt is closed later via
/// [`StateStore::finish_execution`].
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub job_id: Uuid,
    pub attempt_number: u32,
    pub worker_id: String,
    pub worker_hostname: String,
    pub started_at: DateTime<Utc>,
}

/// Durable job persistence.
///
/// Methods return `anyhow::Result`; callers that cross the API boundary map
/// failures onto [`QueueError`](crate::error::QueueError).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new Pending job from a validated spec.
    ///
    /// On an idempotency-key collision the prior job is returned unchanged
    /// and nothing is written.
    async fn create_job(&self, spec: &JobSpec) -> Result<CreateOutcome>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Page through jobs ordered by `created_at` descending. Returns the
    /// page plus the total row count for the filter.
    async fn list_jobs(&self, filter: &JobFilter, page: u32, per_page: u32)
        -> Result<(Vec<Job>, u64)>;

    /// Transition a job's status and apply the patch in one transaction.
    ///
    /// Maintains `updated_at`, sets `started_at` on Running and
    /// `completed_at` on terminal states. Returns false without writing when
    /// the job is missing or already in a terminal status.
    async fn set_status(&self, id: Uuid, status: JobStatus, patch: StatusPatch) -> Result<bool>;

    /// Record a parent → child edge. Duplicate edges are ignored. Cycle
    /// rejection happens in the resolver before this is called.
    async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<()>;

    async fn parents_of(&self, id: Uuid) -> Result<Vec<Uuid>>;

    async fn children_of(&self, id: Uuid) -> Result<Vec<Uuid>>;

    /// Statuses of every parent of `id`.
    async fn parent_statuses(&self, id: Uuid) -> Result<Vec<JobStatus>>;

    /// Blocked direct children of `parent` (promotion fast path).
    async fn blocked_children_of(&self, parent: Uuid) -> Result<Vec<Job>>;

    /// Ready jobs ordered by priority class then `created_at`.
    async fn find_ready_batch(&self, limit: u32) -> Result<Vec<Job>>;

    /// Pending jobs whose `next_retry_at` is at or before `now`.
    async fn find_due_retries(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>>;

    /// Blocked jobs, oldest first (backstop sweep).
    async fn find_blocked(&self, limit: u32) -> Result<Vec<Job>>;

    /// Jobs currently marked Running (timeout sweep, crash recovery).
    async fn running_jobs(&self) -> Result<Vec<Job>>;

    /// Crash recovery: every Running job goes back to Pending with its
    /// attempt counter untouched and `next_retry_at = now`, so the retry
    /// scan re-admits it. Returns the number of jobs reset.
    async fn reset_orphaned_running(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// 1-based position among waiting jobs: the count of Pending∪Ready jobs
    /// with strictly higher priority, plus equal-priority jobs created
    /// earlier (ties broken by id), plus one.
    async fn queue_position(&self, job: &Job) -> Result<u64>;

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        context: &str,
    ) -> Result<()>;

    /// Logs for a job, newest first.
    async fn logs_for(&self, job_id: Uuid) -> Result<Vec<LogEntry>>;

    /// Open an execution row for an attempt; returns its id.
    async fn append_execution(&self, row: NewExecution) -> Result<Uuid>;

    /// Close an execution row with its outcome.
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<&str>,
        error_traceback: Option<&str>,
        result: Option<&Value>,
    ) -> Result<()>;

    /// Executions for a job, oldest first.
    async fn executions_for(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>>;

    /// Cheap connectivity probe for health reporting.
    async fn ping(&self) -> Result<()>;
}
