//! Job model: the unit of work tracked by the queue.
//!
//! A [`Job`] is a durable record; the engine mutates it through the
//! [`StateStore`](crate::store::StateStore) only. Submissions arrive as a
//! [`JobSpec`], which is validated before anything is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

/// Longest accepted job type tag.
pub const MAX_TYPE_LEN: usize = 50;
/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
/// Most parents a single job may declare.
pub const MAX_DEPENDENCIES: usize = 10;
/// CPU units a job may request, inclusive.
pub const CPU_UNITS_RANGE: (u32, u32) = (1, 16);
/// Memory megabytes a job may request, inclusive.
pub const MEMORY_MB_RANGE: (u64, u64) = (64, 8192);
/// Timeout seconds, inclusive (up to 24 hours).
pub const TIMEOUT_SECONDS_RANGE: (u64, u64) = (1, 86_400);
/// Attempts, inclusive.
pub const MAX_ATTEMPTS_RANGE: (u32, u32) = (1, 10);
/// Backoff multiplier, inclusive.
pub const BACKOFF_MULTIPLIER_RANGE: (f64, f64) = (1.0, 10.0);

/// Lifecycle state of a job.
///
/// Completed, Failed, Cancelled and Timeout are terminal: once entered they
/// are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Waiting for dependencies.
    Blocked,
    Timeout,
}

impl JobStatus {
    /// True for states a job can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// True for states from which a user cancel is accepted.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Ready | JobStatus::Blocked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Blocked => "blocked",
            JobStatus::Timeout => "timeout",
        }
    }

    /// Every status, in a stable order (used for count rollups).
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Ready,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Blocked,
        JobStatus::Timeout,
    ];
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "ready" => Ok(JobStatus::Ready),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "blocked" => Ok(JobStatus::Blocked),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(QueueError::Validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling class. Critical beats High beats Normal beats Low, strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Dense rank for ordered scans (lower = more urgent).
    pub fn rank(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// Bands in pop order, most urgent first.
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];
}

impl std::str::FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(JobPriority::Critical),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(QueueError::Validation(format!(
                "unknown job priority: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,

    /// Opaque handler input.
    pub payload: Value,

    // Resource requirements
    pub cpu_units: u32,
    pub memory_mb: u64,

    // Timing and retry configuration
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub current_attempt: u32,
    pub backoff_multiplier: f64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub idempotency_key: Option<String>,

    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl Job {
    /// Materialize a fresh Pending record from a validated spec.
    pub fn from_spec(spec: &JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type.clone(),
            status: JobStatus::Pending,
            priority: spec.priority,
            payload: spec.payload.clone(),
            cpu_units: spec.cpu_units,
            memory_mb: spec.memory_mb,
            timeout_seconds: spec.timeout_seconds,
            max_attempts: spec.max_attempts,
            current_attempt: 0,
            backoff_multiplier: spec.backoff_multiplier,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            idempotency_key: spec.idempotency_key.clone(),
            result: None,
            error_message: None,
        }
    }

    /// 1-based label for the attempt currently running or about to run.
    pub fn attempt_number(&self) -> u32 {
        self.current_attempt + 1
    }

    /// Ordering key inside a priority band: creation time, ties by id.
    pub fn fifo_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// A validated submission. Produced by [`JobSpec::validate`]d builders at the
/// admission edge; everything the store needs to mint a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub priority: JobPriority,
    pub payload: Value,
    pub cpu_units: u32,
    pub memory_mb: u64,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub depends_on: Vec<Uuid>,
    pub idempotency_key: Option<String>,
}

impl JobSpec {
    /// A minimal spec with the configured defaults.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: JobPriority::Normal,
            payload: Value::Object(Default::default()),
            cpu_units: 1,
            memory_mb: 128,
            timeout_seconds: 3600,
            max_attempts: 3,
            backoff_multiplier: 2.0,
            depends_on: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn resources(mut self, cpu_units: u32, memory_mb: u64) -> Self {
        self.cpu_units = cpu_units;
        self.memory_mb = memory_mb;
        self
    }

    pub fn timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn retries(mut self, max_attempts: u32, backoff_multiplier: f64) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn depends_on(mut self, parents: impl IntoIterator<Item = Uuid>) -> Self {
        self.depends_on = parents.into_iter().collect();
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Check every field range. Nothing is persisted when this fails.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.job_type.is_empty() || self.job_type.len() > MAX_TYPE_LEN {
            return Err(QueueError::Validation(format!(
                "job type must be 1-{MAX_TYPE_LEN} characters"
            )));
        }
        if !self.payload.is_object() {
            return Err(QueueError::Validation(
                "payload must be a JSON object".into(),
            ));
        }
        range_check("cpu_units", self.cpu_units as u64, CPU_UNITS_RANGE.0 as u64, CPU_UNITS_RANGE.1 as u64)?;
        range_check("memory_mb", self.memory_mb, MEMORY_MB_RANGE.0, MEMORY_MB_RANGE.1)?;
        range_check(
            "timeout_seconds",
            self.timeout_seconds,
            TIMEOUT_SECONDS_RANGE.0,
            TIMEOUT_SECONDS_RANGE.1,
        )?;
        range_check(
            "max_attempts",
            self.max_attempts as u64,
            MAX_ATTEMPTS_RANGE.0 as u64,
            MAX_ATTEMPTS_RANGE.1 as u64,
        )?;
        if !(BACKOFF_MULTIPLIER_RANGE.0..=BACKOFF_MULTIPLIER_RANGE.1).contains(&self.backoff_multiplier) {
            return Err(QueueError::Validation(format!(
                "backoff_multiplier must be within {:?}",
                BACKOFF_MULTIPLIER_RANGE
            )));
        }
        if self.depends_on.len() > MAX_DEPENDENCIES {
            return Err(QueueError::Validation(format!(
                "cannot depend on more than {MAX_DEPENDENCIES} jobs"
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(QueueError::Validation(format!(
                    "idempotency_key must be 1-{MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

fn range_check(field: &str, value: u64, lo: u64, hi: u64) -> Result<(), QueueError> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(QueueError::Validation(format!(
            "{field} must be within {lo}..={hi}, got {value}"
        )))
    }
}

/// Terminal state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ExecutionStatus::Started),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(QueueError::Validation(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// One row per attempt, append-only for the life of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-based.
    pub attempt_number: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub worker_id: String,
    pub worker_hostname: String,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub result: Option<Value>,
}

/// Severity of a job audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(QueueError::Validation(format!("unknown log level: {other}"))),
        }
    }
}

/// Structured audit line attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Origin tag, e.g. "scheduler" or "admission".
    pub context: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        for status in JobStatus::ALL {
            let terminal = matches!(
                status,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
            );
            assert_eq!(status.is_terminal(), terminal);
        }
    }

    #[test]
    fn priority_rank_orders_bands() {
        assert!(JobPriority::Critical.rank() < JobPriority::High.rank());
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
        assert!(JobPriority::Normal.rank() < JobPriority::Low.rank());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn spec_defaults_validate() {
        JobSpec::new("send_email").validate().unwrap();
    }

    #[test]
    fn spec_rejects_out_of_range_fields() {
        assert!(JobSpec::new("").validate().is_err());
        assert!(JobSpec::new("x".repeat(51)).validate().is_err());
        assert!(JobSpec::new("j").timeout_seconds(0).validate().is_err());
        assert!(JobSpec::new("j").timeout_seconds(86_401).validate().is_err());
        assert!(JobSpec::new("j").resources(0, 128).validate().is_err());
        assert!(JobSpec::new("j").resources(17, 128).validate().is_err());
        assert!(JobSpec::new("j").resources(1, 63).validate().is_err());
        assert!(JobSpec::new("j").resources(1, 8193).validate().is_err());
        assert!(JobSpec::new("j").retries(0, 2.0).validate().is_err());
        assert!(JobSpec::new("j").retries(11, 2.0).validate().is_err());
        assert!(JobSpec::new("j").retries(3, 0.5).validate().is_err());
        assert!(JobSpec::new("j").retries(3, 10.5).validate().is_err());
    }

    #[test]
    fn spec_rejects_eleven_dependencies() {
        let parents: Vec<Uuid> = (0..11).map(|_| Uuid::new_v4()).collect();
        let err = JobSpec::new("fanin").depends_on(parents).validate();
        assert!(matches!(err, Err(QueueError::Validation(_))));
    }

    #[test]
    fn spec_rejects_oversized_idempotency_key() {
        let err = JobSpec::new("j").idempotency_key("k".repeat(256)).validate();
        assert!(err.is_err());
    }

    #[test]
    fn job_from_spec_starts_pending_at_attempt_zero() {
        let spec = JobSpec::new("data_export").priority(JobPriority::High);
        let job = Job::from_spec(&spec, Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_attempt, 0);
        assert_eq!(job.attempt_number(), 1);
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.created_at, job.updated_at);
    }
}
