//! Dead-letter sink on a Redis list plus a stats hash.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};
use uuid::Uuid;

use conveyor_core::{DeadLetterEntry, DeadLetterSink, DlqStats};

use crate::with_backoff;

const DLQ_KEY: &str = "task_queue:dead_letter";
const DLQ_STATS_KEY: &str = "task_queue:dlq_stats";

const TOTAL_FAILED_FIELD: &str = "total_failed";
const LAST_FAILURE_FIELD: &str = "last_failure";
const FAILED_TYPE_PREFIX: &str = "failed_";

/// Redis-backed dead-letter sink shared by cooperating processes.
pub struct RedisDeadLetterSink {
    conn: ConnectionManager,
}

impl RedisDeadLetterSink {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn raw_entries(&self, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(DLQ_KEY, start as isize, stop as isize).await?)
    }

    fn parse_entries(raw: Vec<String>) -> Vec<DeadLetterEntry> {
        raw.iter()
            .filter_map(|data| match serde_json::from_str(data) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping malformed dead-letter entry");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<()> {
        let raw = serde_json::to_string(&entry)?;
        let type_field = format!("{FAILED_TYPE_PREFIX}{}", entry.job_type);
        let failed_at = entry.failed_at.to_rfc3339();

        with_backoff("dlq_enqueue", || {
            let mut conn = self.conn.clone();
            let raw = raw.clone();
            let type_field = type_field.clone();
            let failed_at = failed_at.clone();
            async move {
                redis::pipe()
                    .lpush(DLQ_KEY, raw)
                    .ignore()
                    .hincr(DLQ_STATS_KEY, TOTAL_FAILED_FIELD, 1)
                    .ignore()
                    .hincr(DLQ_STATS_KEY, type_field, 1)
                    .ignore()
                    .hset(DLQ_STATS_KEY, LAST_FAILURE_FIELD, failed_at)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await?;

        warn!(
            job_id = %entry.job_id,
            job_type = %entry.job_type,
            error = %entry.error_message,
            "job added to dead letter queue"
        );
        Ok(())
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .raw_entries(offset as i64, (offset + limit) as i64 - 1)
            .await?;
        Ok(Self::parse_entries(raw))
    }

    async fn count(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(DLQ_KEY).await?;
        Ok(len as u64)
    }

    async fn stats(&self) -> Result<DlqStats> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(DLQ_STATS_KEY).await?;

        let mut stats = DlqStats {
            total_jobs: self.count().await?,
            ..DlqStats::default()
        };
        for (field, value) in fields {
            if field == TOTAL_FAILED_FIELD {
                stats.total_failed = value.parse().unwrap_or(0);
            } else if field == LAST_FAILURE_FIELD {
                stats.last_failure = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|at| at.with_timezone(&Utc));
            } else if let Some(job_type) = field.strip_prefix(FAILED_TYPE_PREFIX) {
                stats
                    .failed_by_type
                    .insert(job_type.to_string(), value.parse().unwrap_or(0));
            }
        }
        Ok(stats)
    }

    async fn recent(&self, limit: u64) -> Result<Vec<DeadLetterEntry>> {
        self.list(0, limit).await
    }

    async fn remove_one(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let raw = self.raw_entries(0, -1).await?;
        for data in raw {
            let Ok(entry) = serde_json::from_str::<DeadLetterEntry>(&data) else {
                continue;
            };
            if entry.job_id == job_id {
                let mut conn = self.conn.clone();
                let _: i64 = conn.lrem(DLQ_KEY, 1, data).await?;
                info!(job_id = %job_id, "removed job from dead letter queue");
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn clear(&self, job_type: Option<&str>) -> Result<u64> {
        let mut conn = self.conn.clone();
        match job_type {
            None => {
                let removed = self.count().await?;
                let _: () = redis::pipe()
                    .del(DLQ_KEY)
                    .ignore()
                    .del(DLQ_STATS_KEY)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                info!(count = removed, "cleared dead letter queue");
                Ok(removed)
            }
            Some(kind) => {
                let raw = self.raw_entries(0, -1).await?;
                let mut removed = 0;
                for data in raw {
                    let matches = serde_json::from_str::<DeadLetterEntry>(&data)
                        .map(|entry| entry.job_type == kind)
                        .unwrap_or(false);
                    if matches {
                        let count: i64 = conn.lrem(DLQ_KEY, 1, data).await?;
                        removed += count as u64;
                    }
                }
                info!(count = removed, job_type = kind, "cleared dead letter entries");
                Ok(removed)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        (pong == "PONG")
            .then_some(())
            .context("unexpected PING reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stats_field_names_match_the_wire_format() {
        assert_eq!(TOTAL_FAILED_FIELD, "total_failed");
        assert_eq!(LAST_FAILURE_FIELD, "last_failure");
        assert_eq!(format!("{FAILED_TYPE_PREFIX}send_email"), "failed_send_email");
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let entry = DeadLetterEntry {
            job_id: Uuid::new_v4(),
            job_type: "data_export".to_string(),
            error_message: "boom".to_string(),
            attempts: 3,
            payload: json!({}),
            failed_at: Utc::now(),
            added_at: Utc::now(),
        };
        let raw = vec![
            "not-json".to_string(),
            serde_json::to_string(&entry).unwrap(),
        ];
        let parsed = RedisDeadLetterSink::parse_entries(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].job_id, entry.job_id);
    }
}
