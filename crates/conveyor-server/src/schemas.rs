//! Request and response shapes for the jobs API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use conveyor_core::{
    JobDetails, JobPriority, JobSpec, JobStatus, LogEntry, QueueError,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ResourceRequirements {
    #[validate(range(min = 1, max = 16))]
    #[serde(default = "default_cpu_units")]
    pub cpu_units: u32,
    #[validate(range(min = 64, max = 8192))]
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_cpu_units() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    128
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_units: default_cpu_units(),
            memory_mb: default_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[validate(range(min = 1.0, max = 10.0))]
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 50))]
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    #[validate(nested)]
    pub resource_requirements: ResourceRequirements,
    #[serde(default)]
    #[validate(length(max = 10))]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    #[validate(nested)]
    pub retry_config: RetryConfig,
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[validate(length(max = 255))]
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    3600
}

impl CreateJobRequest {
    pub fn into_spec(self) -> JobSpec {
        let mut spec = JobSpec::new(self.job_type)
            .priority(self.priority)
            .resources(
                self.resource_requirements.cpu_units,
                self.resource_requirements.memory_mb,
            )
            .timeout_seconds(self.timeout_seconds)
            .retries(
                self.retry_config.max_attempts,
                self.retry_config.backoff_multiplier,
            )
            .depends_on(self.depends_on);
        if let Some(payload) = self.payload {
            spec = spec.payload(payload);
        }
        if let Some(key) = self.idempotency_key {
            spec = spec.idempotency_key(key);
        }
        spec
    }
}

/// Filters for `GET /jobs`. Status and priority arrive as strings so a bad
/// value is a 400, not a deserialization failure on the whole query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub job_type: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

impl ListJobsQuery {
    pub fn parsed_status(&self) -> Result<Option<JobStatus>, QueueError> {
        self.status.as_deref().map(str::parse).transpose()
    }

    pub fn parsed_priority(&self) -> Result<Option<JobPriority>, QueueError> {
        self.priority.as_deref().map(str::parse).transpose()
    }
}

/// A job as the API reports it.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: Value,
    pub cpu_units: u32,
    pub memory_mb: u64,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub current_attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub position_in_queue: Option<u64>,
}

impl From<JobDetails> for JobResponse {
    fn from(details: JobDetails) -> Self {
        let job = details.job;
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            payload: job.payload,
            cpu_units: job.cpu_units,
            memory_mb: job.memory_mb,
            timeout_seconds: job.timeout_seconds,
            max_attempts: job.max_attempts,
            current_attempt: job.current_attempt,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            next_retry_at: job.next_retry_at,
            result: job.result,
            error_message: job.error_message,
            position_in_queue: details.position_in_queue,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Serialize)]
pub struct JobLogResponse {
    pub id: Uuid,
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub context: String,
}

impl From<LogEntry> for JobLogResponse {
    fn from(entry: LogEntry) -> Self {
        Self {
            id: entry.id,
            level: entry.level.as_str().to_string(),
            message: entry.message,
            timestamp: entry.timestamp,
            context: entry.context,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub logs: Vec<JobLogResponse>,
    pub total: u64,
}
