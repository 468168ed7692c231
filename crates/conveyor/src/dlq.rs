//! Dead-letter sink: jobs that exhausted their retries.
//!
//! Append-only list of terminal failures plus a rollup (total, per-type
//! counters, last failure time). Entries can be browsed, removed one at a
//! time for re-admission, or cleared wholesale.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::Job;

/// Snapshot of a permanently failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: Uuid,
    pub job_type: String,
    pub error_message: String,
    /// Total attempts made before giving up.
    pub attempts: u32,
    /// Payload at the time of failure, kept so the job can be re-created.
    pub payload: Value,
    pub failed_at: DateTime<Utc>,
    pub added_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn for_job(job: &Job, error_message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            error_message: error_message.into(),
            attempts: job.max_attempts,
            payload: job.payload.clone(),
            failed_at: now,
            added_at: now,
        }
    }
}

/// Rollup counters over the sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqStats {
    pub total_failed: u64,
    /// Failure count keyed by job type.
    pub failed_by_type: HashMap<String, u64>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Entries currently held (removals and clears shrink this, not the
    /// counters above).
    pub total_jobs: u64,
}

/// Durable list of permanently failed jobs.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append an entry and bump the rollup counters.
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<()>;

    /// Page through entries, newest first.
    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetterEntry>>;

    async fn count(&self) -> Result<u64>;

    async fn stats(&self) -> Result<DlqStats>;

    /// The most recent failures.
    async fn recent(&self, limit: u64) -> Result<Vec<DeadLetterEntry>>;

    /// Scan-and-remove a single entry by job id; returns it so admission can
    /// re-create the job with a fresh identity.
    async fn remove_one(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// Drop entries, optionally only those of one job type. Returns how many
    /// were removed. Clearing everything also resets the rollup.
    async fn clear(&self, job_type: Option<&str>) -> Result<u64>;

    /// Cheap connectivity probe for health reporting.
    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct DlqInner {
    /// Newest first, matching list order.
    entries: Vec<DeadLetterEntry>,
    total_failed: u64,
    failed_by_type: HashMap<String, u64>,
    last_failure: Option<DateTime<Utc>>,
}

/// Process-local dead-letter sink.
pub struct InMemoryDeadLetterSink {
    inner: Mutex<DlqInner>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DlqInner::default()),
        }
    }
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        inner.total_failed += 1;
        *inner
            .failed_by_type
            .entry(entry.job_type.clone())
            .or_insert(0) += 1;
        inner.last_failure = Some(entry.failed_at);
        inner.entries.insert(0, entry);
        Ok(())
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        Ok(inner
            .entries
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        Ok(inner.entries.len() as u64)
    }

    async fn stats(&self) -> Result<DlqStats> {
        let inner = self.inner.lock().expect("dlq lock poisoned");
        Ok(DlqStats {
            total_failed: inner.total_failed,
            failed_by_type: inner.failed_by_type.clone(),
            last_failure: inner.last_failure,
            total_jobs: inner.entries.len() as u64,
        })
    }

    async fn recent(&self, limit: u64) -> Result<Vec<DeadLetterEntry>> {
        self.list(0, limit).await
    }

    async fn remove_one(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        let position = inner.entries.iter().position(|e| e.job_id == job_id);
        Ok(position.map(|at| inner.entries.remove(at)))
    }

    async fn clear(&self, job_type: Option<&str>) -> Result<u64> {
        let mut inner = self.inner.lock().expect("dlq lock poisoned");
        match job_type {
            Some(kind) => {
                let before = inner.entries.len();
                inner.entries.retain(|e| e.job_type != kind);
                Ok((before - inner.entries.len()) as u64)
            }
            None => {
                let removed = inner.entries.len() as u64;
                *inner = DlqInner::default();
                Ok(removed)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_type: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            error_message: "handler exploded".to_string(),
            attempts: 3,
            payload: serde_json::json!({"input": 1}),
            failed_at: Utc::now(),
            added_at: Utc::now(),
        }
    }

    #[test]
    fn entry_roundtrips_through_json() {
        let original = entry("send_email");
        let json = serde_json::to_string(&original).unwrap();
        let parsed: DeadLetterEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, original.job_id);
        assert_eq!(parsed.attempts, 3);
    }

    #[tokio::test]
    async fn enqueue_updates_stats_and_orders_newest_first() {
        let sink = InMemoryDeadLetterSink::new();
        let first = entry("send_email");
        let second = entry("data_export");
        sink.enqueue(first.clone()).await.unwrap();
        sink.enqueue(second.clone()).await.unwrap();

        let listed = sink.list(0, 10).await.unwrap();
        assert_eq!(listed[0].job_id, second.job_id);
        assert_eq!(listed[1].job_id, first.job_id);

        let stats = sink.stats().await.unwrap();
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.failed_by_type["send_email"], 1);
        assert_eq!(stats.failed_by_type["data_export"], 1);
        assert!(stats.last_failure.is_some());
    }

    #[tokio::test]
    async fn remove_one_returns_the_entry() {
        let sink = InMemoryDeadLetterSink::new();
        let target = entry("report_generation");
        sink.enqueue(entry("other")).await.unwrap();
        sink.enqueue(target.clone()).await.unwrap();

        let removed = sink.remove_one(target.job_id).await.unwrap().unwrap();
        assert_eq!(removed.job_id, target.job_id);
        assert_eq!(sink.count().await.unwrap(), 1);
        assert!(sink.remove_one(target.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_filters_by_type() {
        let sink = InMemoryDeadLetterSink::new();
        sink.enqueue(entry("send_email")).await.unwrap();
        sink.enqueue(entry("send_email")).await.unwrap();
        sink.enqueue(entry("data_export")).await.unwrap();

        assert_eq!(sink.clear(Some("send_email")).await.unwrap(), 2);
        assert_eq!(sink.count().await.unwrap(), 1);
        assert_eq!(sink.clear(None).await.unwrap(), 1);
        assert_eq!(sink.stats().await.unwrap().total_failed, 0);
    }
}
