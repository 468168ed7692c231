//! PostgreSQL implementation of the Conveyor state store.
//!
//! This crate provides the durable backend for the `StateStore` trait from
//! `conveyor-core`.
//!
//! # Features
//!
//! - Single-statement status writes that maintain `updated_at`,
//!   `started_at` and `completed_at` together with the status
//! - Terminal statuses guarded in SQL: a Completed/Failed/Cancelled/Timeout
//!   row refuses further transitions
//! - Idempotency enforced by a unique index; collisions return the prior row
//! - Composite indexes for the dispatcher's hot scans (ready batch, due
//!   retries, blocked children)
//! - Crash recovery: orphaned Running jobs drop back to Pending
//!
//! # Database Schema
//!
//! See `schema.sql` (idempotent DDL, applied by [`PgStateStore::init_schema`]):
//! `jobs`, `job_dependencies`, `job_executions`, `job_logs`, with a
//! `(status, priority_rank, created_at)` composite index, a partial index on
//! `status = 'ready'`, and `(next_retry_at, status)`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_store_postgres::PgStateStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect(&config.database_url).await?;
//! let store = PgStateStore::new(pool);
//! store.init_schema().await?;
//!
//! let engine = EngineBuilder::new(config, Arc::new(store)).build();
//! ```

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use conveyor_core::{
    CreateOutcome, ExecutionRecord, ExecutionStatus, Job, JobFilter, JobSpec, JobStatus,
    LogEntry, LogLevel, NewExecution, StateStore, StatusPatch,
};

/// Idempotent DDL for the four tables and their indexes.
const SCHEMA: &str = include_str!("../schema.sql");

/// Every column of `jobs`, in the order [`job_from_row`] reads them.
const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, cpu_units, memory_mb, \
     timeout_seconds, max_attempts, current_attempt, backoff_multiplier, \
     created_at, updated_at, started_at, completed_at, next_retry_at, \
     idempotency_key, result, error_message";

/// SQL list of the terminal statuses (sink guard in UPDATE statements).
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'timeout')";

/// PostgreSQL state store.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `schema.sql`. Safe to call at every startup.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        info!("database schema applied");
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_jobs(&self, sql: &str, bind_id: Option<Uuid>) -> Result<Vec<Job>> {
        let query = sqlx::query(sql);
        let query = match bind_id {
            Some(id) => query.bind(id),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.get("status");
    let priority: String = row.get("priority");
    Ok(Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        status: status.parse()?,
        priority: priority.parse()?,
        payload: row.get("payload"),
        cpu_units: row.get::<i32, _>("cpu_units") as u32,
        memory_mb: row.get::<i64, _>("memory_mb") as u64,
        timeout_seconds: row.get::<i64, _>("timeout_seconds") as u64,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        current_attempt: row.get::<i32, _>("current_attempt") as u32,
        backoff_multiplier: row.get("backoff_multiplier"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        next_retry_at: row.get("next_retry_at"),
        idempotency_key: row.get("idempotency_key"),
        result: row.get("result"),
        error_message: row.get("error_message"),
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord> {
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        id: row.get("id"),
        job_id: row.get("job_id"),
        attempt_number: row.get::<i32, _>("attempt_number") as u32,
        status: status.parse()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_seconds: row.get("duration_seconds"),
        worker_id: row.get("worker_id"),
        worker_hostname: row.get("worker_hostname"),
        error_message: row.get("error_message"),
        error_traceback: row.get("error_traceback"),
        result: row.get("result"),
    })
}

fn prefixed_job_columns() -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|col| format!("j.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StateStore for PgStateStore {
    /// Insert a Pending row; a reused idempotency key returns the existing
    /// row untouched (`ON CONFLICT DO NOTHING` + re-read).
    async fn create_job(&self, spec: &JobSpec) -> Result<CreateOutcome> {
        let job = Job::from_spec(spec, Utc::now());

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, job_type, status, priority, priority_rank, payload,
                cpu_units, memory_mb, timeout_seconds, max_attempts,
                current_attempt, backoff_multiplier, created_at, updated_at,
                idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.priority.rank())
        .bind(&job.payload)
        .bind(job.cpu_units as i32)
        .bind(job.memory_mb as i64)
        .bind(job.timeout_seconds as i64)
        .bind(job.max_attempts as i32)
        .bind(job.current_attempt as i32)
        .bind(job.backoff_multiplier)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(CreateOutcome::Created(job_from_row(&row)?)),
            None => {
                let key = spec
                    .idempotency_key
                    .as_deref()
                    .context("insert conflicted without an idempotency key")?;
                let existing = self
                    .find_by_idempotency_key(key)
                    .await?
                    .context("conflicting job disappeared")?;
                Ok(CreateOutcome::Duplicate(existing))
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Job>, u64)> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let priority = filter.priority.map(|p| p.as_str().to_string());
        let job_type = filter.job_type.clone();
        let conditions = r#"($1::text IS NULL OR status = $1)
            AND ($2::text IS NULL OR priority = $2)
            AND ($3::text IS NULL OR job_type ILIKE '%' || $3 || '%')"#;

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM jobs WHERE {conditions}"))
                .bind(&status)
                .bind(&priority)
                .bind(&job_type)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE {conditions}
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(&status)
        .bind(&priority)
        .bind(&job_type)
        .bind(per_page as i64)
        .bind(((page - 1) * per_page) as i64)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total as u64))
    }

    async fn set_status(&self, id: Uuid, status: JobStatus, patch: StatusPatch) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = $2,
                updated_at = NOW(),
                started_at = CASE WHEN $3 THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
                current_attempt = COALESCE($5, current_attempt),
                next_retry_at = COALESCE($6, next_retry_at),
                error_message = COALESCE($7, error_message),
                result = COALESCE($8, result)
            WHERE id = $1
              AND status NOT IN {TERMINAL_STATUSES}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(status == JobStatus::Running)
        .bind(status.is_terminal())
        .bind(patch.current_attempt.map(|a| a as i32))
        .bind(patch.next_retry_at)
        .bind(patch.error_message)
        .bind(patch.result)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_dependencies (id, parent_job_id, child_job_id)
            VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT unique_dependency DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(parent)
        .bind(child)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn parents_of(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let rows =
            sqlx::query("SELECT parent_job_id FROM job_dependencies WHERE child_job_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("parent_job_id")).collect())
    }

    async fn children_of(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let rows =
            sqlx::query("SELECT child_job_id FROM job_dependencies WHERE parent_job_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("child_job_id")).collect())
    }

    async fn parent_statuses(&self, id: Uuid) -> Result<Vec<JobStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT j.status
            FROM jobs j
            JOIN job_dependencies d ON j.id = d.parent_job_id
            WHERE d.child_job_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let status: String = r.get("status");
                Ok(status.parse()?)
            })
            .collect()
    }

    async fn blocked_children_of(&self, parent: Uuid) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {columns}
            FROM jobs j
            JOIN job_dependencies d ON j.id = d.child_job_id
            WHERE d.parent_job_id = $1
              AND j.status = 'blocked'
            "#,
            columns = prefixed_job_columns()
        );
        self.fetch_jobs(&sql, Some(parent)).await
    }

    async fn find_ready_batch(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'ready'
            ORDER BY priority_rank ASC, created_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'pending'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn find_blocked(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'blocked'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn running_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running'");
        self.fetch_jobs(&sql, None).await
    }

    async fn reset_orphaned_running(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_retry_at = $1,
                updated_at = NOW()
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            counts.insert(status.parse::<JobStatus>()?, total as u64);
        }
        Ok(counts)
    }

    async fn queue_position(&self, job: &Job) -> Result<u64> {
        let ahead: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE status IN ('pending', 'ready')
              AND id <> $1
              AND (priority_rank < $2
                   OR (priority_rank = $2
                       AND (created_at < $3 OR (created_at = $3 AND id < $1))))
            "#,
        )
        .bind(job.id)
        .bind(job.priority.rank())
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(ahead as u64 + 1)
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        context: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, level, message, context)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(level.as_str())
        .bind(message)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn logs_for(&self, job_id: Uuid) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, level, message, timestamp, context
            FROM job_logs
            WHERE job_id = $1
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let level: String = row.get("level");
                Ok(LogEntry {
                    id: row.get("id"),
                    job_id: row.get("job_id"),
                    level: level.parse()?,
                    message: row.get("message"),
                    timestamp: row.get("timestamp"),
                    context: row.get::<Option<String>, _>("context").unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn append_execution(&self, row: NewExecution) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_id, attempt_number, status, started_at,
                worker_id, worker_hostname
            )
            VALUES ($1, $2, $3, 'started', $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(row.job_id)
        .bind(row.attempt_number as i32)
        .bind(row.started_at)
        .bind(&row.worker_id)
        .bind(&row.worker_hostname)
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2,
                completed_at = $3,
                duration_seconds = EXTRACT(EPOCH FROM ($3 - started_at))::BIGINT,
                error_message = $4,
                error_traceback = $5,
                result = $6
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(error_message)
        .bind(error_traceback)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn executions_for(&self, job_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, attempt_number, status, started_at, completed_at,
                   duration_seconds, worker_id, worker_hostname,
                   error_message, error_traceback, result
            FROM job_executions
            WHERE job_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_columns_cover_every_job_column() {
        let prefixed = prefixed_job_columns();
        assert_eq!(
            prefixed.matches("j.").count(),
            JOB_COLUMNS.split(", ").count()
        );
        assert!(prefixed.starts_with("j.id"));
        assert!(prefixed.ends_with("j.error_message"));
    }

    #[test]
    fn terminal_status_guard_lists_every_sink() {
        for status in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            assert!(TERMINAL_STATUSES.contains(status.as_str()));
        }
    }

    #[test]
    fn schema_creates_all_four_tables() {
        for table in ["jobs", "job_dependencies", "job_executions", "job_logs"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
