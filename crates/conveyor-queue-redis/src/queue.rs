//! Shared ready queue on Redis lists plus a Lua-scripted ledger.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use conveyor_core::{JobPriority, QueueHandle, ReadyQueue, ResourceSnapshot};

use crate::with_backoff;

/// Pause between admission attempts while the head job does not fit.
const RESOURCE_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Seconds a completion signal survives without being drained.
const RECENTLY_COMPLETED_TTL_SECS: i64 = 60;

const QUEUE_KEYS: [(&str, JobPriority); 4] = [
    ("queue:critical", JobPriority::Critical),
    ("queue:high", JobPriority::High),
    ("queue:normal", JobPriority::Normal),
    ("queue:low", JobPriority::Low),
];

const CPU_KEY: &str = "resources:cpu";
const MEMORY_KEY: &str = "resources:memory";
const MAX_CPU_KEY: &str = "resources:max_cpu";
const MAX_MEMORY_KEY: &str = "resources:max_memory";
const RECENTLY_COMPLETED_KEY: &str = "task_queue:recently_completed";

/// Check-and-deduct: allocate only when both counters stay under their
/// maxima. KEYS = cpu, memory, max_cpu, max_memory; ARGV = cpu_units,
/// memory_mb. Returns 1 on success, 0 when the job does not fit.
const ALLOCATE_SCRIPT: &str = r#"
local cpu = tonumber(redis.call('GET', KEYS[1]) or '0')
local mem = tonumber(redis.call('GET', KEYS[2]) or '0')
local max_cpu = tonumber(redis.call('GET', KEYS[3]) or '0')
local max_mem = tonumber(redis.call('GET', KEYS[4]) or '0')
if cpu + tonumber(ARGV[1]) > max_cpu or mem + tonumber(ARGV[2]) > max_mem then
    return 0
end
redis.call('INCRBY', KEYS[1], ARGV[1])
redis.call('INCRBY', KEYS[2], ARGV[2])
return 1
"#;

/// Saturating release: counters never drop below zero, so a double release
/// under crash-recovery replay is harmless. KEYS = cpu, memory; ARGV =
/// cpu_units, memory_mb.
const RELEASE_SCRIPT: &str = r#"
local cpu = tonumber(redis.call('GET', KEYS[1]) or '0') - tonumber(ARGV[1])
local mem = tonumber(redis.call('GET', KEYS[2]) or '0') - tonumber(ARGV[2])
if cpu < 0 then cpu = 0 end
if mem < 0 then mem = 0 end
redis.call('SET', KEYS[1], cpu)
redis.call('SET', KEYS[2], mem)
return 1
"#;

/// Operator resize, refused while anything is allocated. KEYS = cpu,
/// memory, max_cpu, max_memory; ARGV = new max_cpu, new max_memory.
const UPDATE_LIMITS_SCRIPT: &str = r#"
local cpu = tonumber(redis.call('GET', KEYS[1]) or '0')
local mem = tonumber(redis.call('GET', KEYS[2]) or '0')
if cpu ~= 0 or mem ~= 0 then
    return 0
end
redis.call('SET', KEYS[3], ARGV[1])
redis.call('SET', KEYS[4], ARGV[2])
return 1
"#;

/// Redis-backed ready queue shared by cooperating worker processes.
pub struct RedisReadyQueue {
    conn: ConnectionManager,
    allocate: redis::Script,
    release: redis::Script,
    update_limits: redis::Script,
}

impl RedisReadyQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            allocate: redis::Script::new(ALLOCATE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
            update_limits: redis::Script::new(UPDATE_LIMITS_SCRIPT),
        }
    }

    fn key_for(priority: JobPriority) -> &'static str {
        QUEUE_KEYS[priority.rank() as usize].0
    }

    async fn try_allocate(&self, cpu_units: u32, memory_mb: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .allocate
            .key(CPU_KEY)
            .key(MEMORY_KEY)
            .key(MAX_CPU_KEY)
            .key(MAX_MEMORY_KEY)
            .arg(cpu_units as i64)
            .arg(memory_mb as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    /// Pop the head of the most urgent non-empty band without blocking.
    async fn pop_candidate(&self) -> Result<Option<(&'static str, String)>> {
        let mut conn = self.conn.clone();
        for (key, _) in QUEUE_KEYS {
            let raw: Option<String> = conn.lpop(key, None).await?;
            if let Some(raw) = raw {
                return Ok(Some((key, raw)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ReadyQueue for RedisReadyQueue {
    async fn initialize(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .set(MAX_CPU_KEY, max_cpu as i64)
            .ignore()
            .set(MAX_MEMORY_KEY, max_memory_mb as i64)
            .ignore()
            .set(CPU_KEY, 0)
            .ignore()
            .set(MEMORY_KEY, 0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        info!(max_cpu, max_memory_mb, "initialized redis resource ledger");
        Ok(())
    }

    async fn push(&self, handle: QueueHandle) -> Result<()> {
        let key = Self::key_for(handle.priority);
        let raw = serde_json::to_string(&handle)?;
        with_backoff("push", || {
            let mut conn = self.conn.clone();
            let raw = raw.clone();
            async move { conn.rpush::<_, _, ()>(key, raw).await }
        })
        .await?;
        debug!(job_id = %handle.job_id, queue = key, "pushed job");
        Ok(())
    }

    async fn try_pop_admissible(&self, timeout: Duration) -> Result<Option<QueueHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            let candidate = match self.pop_candidate().await? {
                Some(candidate) => Some(candidate),
                None => {
                    // Every band is empty: block on all four keys at once.
                    // BLPOP scans them in the order given, so priority is
                    // preserved when several fill at the same time.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    let mut conn = self.conn.clone();
                    let keys: Vec<&str> = QUEUE_KEYS.iter().map(|(key, _)| *key).collect();
                    // A sub-millisecond timeout would round to 0, which BLPOP
                    // reads as "block forever".
                    let wait = remaining.as_secs_f64().max(0.05);
                    let popped: Option<(String, String)> = conn.blpop(keys, wait).await?;
                    popped.map(|(key, raw)| {
                        let key = QUEUE_KEYS
                            .iter()
                            .map(|(k, _)| *k)
                            .find(|k| *k == key)
                            .unwrap_or(QUEUE_KEYS[0].0);
                        (key, raw)
                    })
                }
            };

            let Some((key, raw)) = candidate else {
                return Ok(None);
            };
            let handle: QueueHandle =
                serde_json::from_str(&raw).context("malformed queue handle")?;

            if self.try_allocate(handle.cpu_units, handle.memory_mb).await? {
                debug!(job_id = %handle.job_id, queue = key, "popped admissible job");
                return Ok(Some(handle));
            }

            // Does not fit: back at the head so band order is preserved.
            let mut conn = self.conn.clone();
            let _: () = conn.lpush(key, raw).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(RESOURCE_RETRY_PAUSE.min(remaining)).await;
        }
    }

    async fn release(&self, cpu_units: u32, memory_mb: u64) -> Result<()> {
        with_backoff("release", || {
            let mut conn = self.conn.clone();
            let script = &self.release;
            async move {
                script
                    .key(CPU_KEY)
                    .key(MEMORY_KEY)
                    .arg(cpu_units as i64)
                    .arg(memory_mb as i64)
                    .invoke_async::<i64>(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn publish_completed(&self, job_id: Uuid) -> Result<()> {
        with_backoff("publish_completed", || {
            let mut conn = self.conn.clone();
            async move {
                redis::pipe()
                    .rpush(RECENTLY_COMPLETED_KEY, job_id.to_string())
                    .ignore()
                    .expire(RECENTLY_COMPLETED_KEY, RECENTLY_COMPLETED_TTL_SECS)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn drain_recently_completed(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        // Read and clear in one round trip so no signal is seen twice.
        let (raw, _): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(RECENTLY_COMPLETED_KEY, 0, -1)
            .del(RECENTLY_COMPLETED_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(raw.iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn resources(&self) -> Result<ResourceSnapshot> {
        let mut conn = self.conn.clone();
        let (cpu, memory, max_cpu, max_memory): (Option<i64>, Option<i64>, Option<i64>, Option<i64>) =
            redis::pipe()
                .get(CPU_KEY)
                .get(MEMORY_KEY)
                .get(MAX_CPU_KEY)
                .get(MAX_MEMORY_KEY)
                .query_async(&mut conn)
                .await?;
        Ok(ResourceSnapshot {
            allocated_cpu: cpu.unwrap_or(0) as u32,
            allocated_memory: memory.unwrap_or(0) as u64,
            max_cpu: max_cpu.unwrap_or(0) as u32,
            max_memory: max_memory.unwrap_or(0) as u64,
        })
    }

    async fn queue_depths(&self) -> Result<Vec<(JobPriority, u64)>> {
        let mut conn = self.conn.clone();
        let mut depths = Vec::with_capacity(QUEUE_KEYS.len());
        for (key, priority) in QUEUE_KEYS {
            let depth: i64 = conn.llen(key).await?;
            depths.push((priority, depth as u64));
        }
        Ok(depths)
    }

    async fn update_limits(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let accepted: i64 = self
            .update_limits
            .key(CPU_KEY)
            .key(MEMORY_KEY)
            .key(MAX_CPU_KEY)
            .key(MAX_MEMORY_KEY)
            .arg(max_cpu as i64)
            .arg(max_memory_mb as i64)
            .invoke_async(&mut conn)
            .await?;
        if accepted != 1 {
            bail!("cannot resize ledger while resources are allocated");
        }
        info!(max_cpu, max_memory_mb, "ledger maxima updated");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, _) in QUEUE_KEYS {
            pipe.del(key).ignore();
        }
        pipe.del(RECENTLY_COMPLETED_KEY).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        info!("cleared redis job queues");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_follow_band_order() {
        for (index, (key, priority)) in QUEUE_KEYS.iter().enumerate() {
            assert_eq!(priority.rank() as usize, index);
            assert_eq!(*key, RedisReadyQueue::key_for(*priority));
        }
    }

    #[test]
    fn allocate_script_checks_both_resources() {
        assert!(ALLOCATE_SCRIPT.contains("max_cpu"));
        assert!(ALLOCATE_SCRIPT.contains("max_mem"));
        assert!(ALLOCATE_SCRIPT.contains("INCRBY"));
    }

    #[test]
    fn release_script_saturates_at_zero() {
        assert!(RELEASE_SCRIPT.contains("if cpu < 0 then cpu = 0 end"));
        assert!(RELEASE_SCRIPT.contains("if mem < 0 then mem = 0 end"));
    }

    #[test]
    fn queue_handle_roundtrips_through_the_wire_format() {
        let handle = QueueHandle {
            job_id: Uuid::new_v4(),
            priority: JobPriority::Critical,
            cpu_units: 4,
            memory_mb: 512,
        };
        let raw = serde_json::to_string(&handle).unwrap();
        let parsed: QueueHandle = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, handle);
    }
}
