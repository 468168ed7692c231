//! In-memory state store.
//!
//! Faithful to the `StateStore` contract including the invariant pieces a
//! backend must own: terminal statuses refuse further transitions, status
//! writes maintain the paired timestamps, and idempotency keys map to one
//! job id forever. Locking is coarse (one map lock per collection); tests
//! do not need more.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use conveyor_core::{
    CreateOutcome, ExecutionRecord, ExecutionStatus, Job, JobFilter, JobStatus, LogEntry,
    LogLevel, NewExecution, StateStore, StatusPatch,
};

/// DashMap-backed store for single-process tests.
#[derive(Default)]
pub struct MemoryStateStore {
    jobs: DashMap<Uuid, Job>,
    /// (parent, child) edges, insertion-ordered.
    edges: Mutex<Vec<(Uuid, Uuid)>>,
    idempotency: Mutex<HashMap<String, Uuid>>,
    logs: Mutex<Vec<LogEntry>>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct snapshot access for assertions.
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Every execution row for a job, oldest first (assertion helper).
    pub fn execution_rows(&self, job_id: Uuid) -> Vec<ExecutionRecord> {
        let executions = self.executions.lock().expect("executions lock poisoned");
        executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    fn waiting_rank(job: &Job) -> (i16, DateTime<Utc>, Uuid) {
        (job.priority.rank(), job.created_at, job.id)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_job(&self, spec: &conveyor_core::JobSpec) -> Result<CreateOutcome> {
        // Key reservation and insertion under one lock: a racing duplicate
        // submission sees exactly one winner.
        let mut keys = self.idempotency.lock().expect("idempotency lock poisoned");
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing_id) = keys.get(key) {
                let existing = self
                    .jobs
                    .get(existing_id)
                    .map(|j| j.clone())
                    .expect("idempotency key maps to a stored job");
                return Ok(CreateOutcome::Duplicate(existing));
            }
        }

        let job = Job::from_spec(spec, Utc::now());
        if let Some(key) = &spec.idempotency_key {
            keys.insert(key.clone(), job.id);
        }
        self.jobs.insert(job.id, job.clone());
        Ok(CreateOutcome::Created(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let keys = self.idempotency.lock().expect("idempotency lock poisoned");
        Ok(keys.get(key).and_then(|id| self.jobs.get(id).map(|j| j.clone())))
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Job>, u64)> {
        let needle = filter.job_type.as_ref().map(|t| t.to_lowercase());
        let mut matched: Vec<Job> = self
            .jobs
            .iter()
            .filter(|job| {
                filter.status.is_none_or(|s| job.status == s)
                    && filter.priority.is_none_or(|p| job.priority == p)
                    && needle
                        .as_ref()
                        .is_none_or(|n| job.job_type.to_lowercase().contains(n))
            })
            .map(|j| j.clone())
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matched.len() as u64;
        let start = ((page - 1) * per_page) as usize;
        let jobs = matched
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();
        Ok((jobs, total))
    }

    async fn set_status(&self, id: Uuid, status: JobStatus, patch: StatusPatch) -> Result<bool> {
        let Some(mut job) = self.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        job.status = status;
        job.updated_at = now;
        if status == JobStatus::Running {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.completed_at = Some(now);
        }
        if let Some(attempt) = patch.current_attempt {
            job.current_attempt = attempt;
        }
        if let Some(retry_at) = patch.next_retry_at {
            job.next_retry_at = Some(retry_at);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        Ok(true)
    }

    async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<()> {
        let mut edges = self.edges.lock().expect("edges lock poisoned");
        if !edges.contains(&(parent, child)) {
            edges.push((parent, child));
        }
        Ok(())
    }

    async fn parents_of(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let edges = self.edges.lock().expect("edges lock poisoned");
        Ok(edges
            .iter()
            .filter(|(_, child)| *child == id)
            .map(|(parent, _)| *parent)
            .collect())
    }

    async fn children_of(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let edges = self.edges.lock().expect("edges lock poisoned");
        Ok(edges
            .iter()
            .filter(|(parent, _)| *parent == id)
            .map(|(_, child)| *child)
            .collect())
    }

    async fn parent_statuses(&self, id: Uuid) -> Result<Vec<JobStatus>> {
        let parents = self.parents_of(id).await?;
        Ok(parents
            .iter()
            .filter_map(|p| self.jobs.get(p).map(|j| j.status))
            .collect())
    }

    async fn blocked_children_of(&self, parent: Uuid) -> Result<Vec<Job>> {
        let children = self.children_of(parent).await?;
        Ok(children
            .iter()
            .filter_map(|c| self.jobs.get(c).map(|j| j.clone()))
            .filter(|j| j.status == JobStatus::Blocked)
            .collect())
    }

    async fn find_ready_batch(&self, limit: u32) -> Result<Vec<Job>> {
        let mut ready: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Ready)
            .map(|j| j.clone())
            .collect();
        ready.sort_by_key(Self::waiting_rank);
        ready.truncate(limit as usize);
        Ok(ready)
    }

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|j| j.clone())
            .collect();
        due.sort_by_key(|j| j.fifo_key());
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_blocked(&self, limit: u32) -> Result<Vec<Job>> {
        let mut blocked: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Blocked)
            .map(|j| j.clone())
            .collect();
        blocked.sort_by_key(|j| j.fifo_key());
        blocked.truncate(limit as usize);
        Ok(blocked)
    }

    async fn running_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.clone())
            .collect())
    }

    async fn reset_orphaned_running(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut reset = 0;
        for mut job in self.jobs.iter_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(now);
                job.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for job in self.jobs.iter() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn queue_position(&self, job: &Job) -> Result<u64> {
        let own_rank = Self::waiting_rank(job);
        let ahead = self
            .jobs
            .iter()
            .filter(|other| {
                matches!(other.status, JobStatus::Pending | JobStatus::Ready)
                    && other.id != job.id
                    && Self::waiting_rank(other.value()) < own_rank
            })
            .count() as u64;
        Ok(ahead + 1)
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        context: &str,
    ) -> Result<()> {
        let mut logs = self.logs.lock().expect("logs lock poisoned");
        logs.push(LogEntry {
            id: Uuid::new_v4(),
            job_id,
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
            context: context.to_string(),
        });
        Ok(())
    }

    async fn logs_for(&self, job_id: Uuid) -> Result<Vec<LogEntry>> {
        let logs = self.logs.lock().expect("logs lock poisoned");
        let mut entries: Vec<LogEntry> = logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        entries.reverse();
        Ok(entries)
    }

    async fn append_execution(&self, row: NewExecution) -> Result<Uuid> {
        let mut executions = self.executions.lock().expect("executions lock poisoned");
        let id = Uuid::new_v4();
        executions.push(ExecutionRecord {
            id,
            job_id: row.job_id,
            attempt_number: row.attempt_number,
            status: ExecutionStatus::Started,
            started_at: row.started_at,
            completed_at: None,
            duration_seconds: None,
            worker_id: row.worker_id,
            worker_hostname: row.worker_hostname,
            error_message: None,
            error_traceback: None,
            result: None,
        });
        Ok(id)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<&str>,
        error_traceback: Option<&str>,
        result: Option<&Value>,
    ) -> Result<()> {
        let mut executions = self.executions.lock().expect("executions lock poisoned");
        if let Some(row) = executions.iter_mut().find(|e| e.id == execution_id) {
            row.status = status;
            row.completed_at = Some(completed_at);
            row.duration_seconds =
                Some(completed_at.signed_duration_since(row.started_at).num_seconds());
            row.error_message = error_message.map(str::to_string);
            row.error_traceback = error_traceback.map(str::to_string);
            row.result = result.cloned();
        }
        Ok(())
    }

    async fn executions_for(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        Ok(self.execution_rows(job_id))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
