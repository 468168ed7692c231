//! Ready queue and resource ledger.
//!
//! Four priority-banded FIFO queues plus an allocation ledger. Admission is
//! the atomic pair "pop the head of the most urgent non-empty band" +
//! "check-and-deduct its resources": if the head does not fit it goes back
//! at the head (never the tail), preserving band order. Strict priority
//! across bands, strict FIFO within a band; a head that does not fit holds
//! its band rather than letting lower-priority work overtake it.
//!
//! [`InMemoryReadyQueue`] is the single-process backend and the test
//! substrate; the Redis backend in `conveyor-queue-redis` shares the same
//! contract for multi-process deployments.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::job::{Job, JobPriority};

/// Pause between admission attempts while the head job does not fit.
const RESOURCE_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// How long a completed-job signal stays observable if nothing drains it.
const RECENTLY_COMPLETED_TTL: Duration = Duration::from_secs(60);

/// What sits in a band: just enough to admit without a store read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHandle {
    pub job_id: Uuid,
    pub priority: JobPriority,
    pub cpu_units: u32,
    pub memory_mb: u64,
}

impl QueueHandle {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            priority: job.priority,
            cpu_units: job.cpu_units,
            memory_mb: job.memory_mb,
        }
    }
}

/// Point-in-time ledger reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub allocated_cpu: u32,
    pub allocated_memory: u64,
    pub max_cpu: u32,
    pub max_memory: u64,
}

/// Priority-banded ready queue with a co-located resource ledger.
#[async_trait]
pub trait ReadyQueue: Send + Sync {
    /// Set ledger maxima and reset allocations to zero. Called once by the
    /// process that owns the dispatcher, before any admission.
    async fn initialize(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()>;

    /// Enqueue at the tail of the handle's priority band. O(1).
    async fn push(&self, handle: QueueHandle) -> Result<()>;

    /// Pop the next admissible job, waiting up to `timeout`.
    ///
    /// Selects the most urgent non-empty band, then check-and-deducts the
    /// head's resources atomically. A head that does not fit goes back at
    /// the head and the call retries after a brief pause; when every band is
    /// empty the call blocks until a push or the deadline.
    async fn try_pop_admissible(&self, timeout: Duration) -> Result<Option<QueueHandle>>;

    /// Return resources to the ledger. Saturating: never drops below zero,
    /// so a double release under crash-recovery replay is harmless.
    async fn release(&self, cpu_units: u32, memory_mb: u64) -> Result<()>;

    /// Announce a terminally finished job on the short-TTL side channel so
    /// the dispatcher re-checks only its direct dependents.
    async fn publish_completed(&self, job_id: Uuid) -> Result<()>;

    /// Take and clear every pending completion signal.
    async fn drain_recently_completed(&self) -> Result<Vec<Uuid>>;

    async fn resources(&self) -> Result<ResourceSnapshot>;

    /// Depth of each band, most urgent first.
    async fn queue_depths(&self) -> Result<Vec<(JobPriority, u64)>>;

    /// Operator action: change ledger maxima. Refused while anything is
    /// allocated.
    async fn update_limits(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()>;

    /// Drop every queued handle and completion signal. Allocations are kept.
    async fn clear(&self) -> Result<()>;

    /// Cheap connectivity probe for health reporting.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Ledger {
    allocated_cpu: u32,
    allocated_memory: u64,
    max_cpu: u32,
    max_memory: u64,
}

/// Process-local ready queue.
///
/// Linearizability of pop + deduct comes from the single-writer dispatcher:
/// only one task pops, so the mutex-guarded check-and-deduct can never
/// interleave with another admission.
pub struct InMemoryReadyQueue {
    bands: Mutex<[VecDeque<QueueHandle>; 4]>,
    ledger: Mutex<Ledger>,
    recently_completed: Mutex<Vec<(Uuid, Instant)>>,
    pushed: Notify,
}

impl InMemoryReadyQueue {
    pub fn new() -> Self {
        Self {
            bands: Mutex::new(Default::default()),
            ledger: Mutex::new(Ledger::default()),
            recently_completed: Mutex::new(Vec::new()),
            pushed: Notify::new(),
        }
    }

    fn band_index(priority: JobPriority) -> usize {
        priority.rank() as usize
    }

    /// Pop the head of the most urgent non-empty band.
    fn pop_candidate(&self) -> Option<QueueHandle> {
        let mut bands = self.bands.lock().expect("band lock poisoned");
        bands.iter_mut().find_map(|band| band.pop_front())
    }

    fn push_back_at_head(&self, handle: QueueHandle) {
        let mut bands = self.bands.lock().expect("band lock poisoned");
        bands[Self::band_index(handle.priority)].push_front(handle);
    }

    fn try_allocate(&self, cpu_units: u32, memory_mb: u64) -> bool {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        let fits = ledger.allocated_cpu + cpu_units <= ledger.max_cpu
            && ledger.allocated_memory + memory_mb <= ledger.max_memory;
        if fits {
            ledger.allocated_cpu += cpu_units;
            ledger.allocated_memory += memory_mb;
        }
        fits
    }
}

impl Default for InMemoryReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadyQueue for InMemoryReadyQueue {
    async fn initialize(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()> {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.max_cpu = max_cpu;
        ledger.max_memory = max_memory_mb;
        ledger.allocated_cpu = 0;
        ledger.allocated_memory = 0;
        Ok(())
    }

    async fn push(&self, handle: QueueHandle) -> Result<()> {
        {
            let mut bands = self.bands.lock().expect("band lock poisoned");
            bands[Self::band_index(handle.priority)].push_back(handle);
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn try_pop_admissible(&self, timeout: Duration) -> Result<Option<QueueHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.pop_candidate() {
                Some(handle) => {
                    if self.try_allocate(handle.cpu_units, handle.memory_mb) {
                        return Ok(Some(handle));
                    }
                    // Head does not fit: back at the head, pause, retry.
                    self.push_back_at_head(handle);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    tokio::time::sleep(RESOURCE_RETRY_PAUSE.min(remaining)).await;
                }
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    let _ = tokio::time::timeout(remaining, self.pushed.notified()).await;
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn release(&self, cpu_units: u32, memory_mb: u64) -> Result<()> {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.allocated_cpu = ledger.allocated_cpu.saturating_sub(cpu_units);
        ledger.allocated_memory = ledger.allocated_memory.saturating_sub(memory_mb);
        Ok(())
    }

    async fn publish_completed(&self, job_id: Uuid) -> Result<()> {
        let mut signals = self
            .recently_completed
            .lock()
            .expect("side channel lock poisoned");
        let now = Instant::now();
        signals.retain(|(_, at)| now.duration_since(*at) < RECENTLY_COMPLETED_TTL);
        signals.push((job_id, now));
        Ok(())
    }

    async fn drain_recently_completed(&self) -> Result<Vec<Uuid>> {
        let mut signals = self
            .recently_completed
            .lock()
            .expect("side channel lock poisoned");
        let now = Instant::now();
        let drained = signals
            .drain(..)
            .filter(|(_, at)| now.duration_since(*at) < RECENTLY_COMPLETED_TTL)
            .map(|(id, _)| id)
            .collect();
        Ok(drained)
    }

    async fn resources(&self) -> Result<ResourceSnapshot> {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        Ok(ResourceSnapshot {
            allocated_cpu: ledger.allocated_cpu,
            allocated_memory: ledger.allocated_memory,
            max_cpu: ledger.max_cpu,
            max_memory: ledger.max_memory,
        })
    }

    async fn queue_depths(&self) -> Result<Vec<(JobPriority, u64)>> {
        let bands = self.bands.lock().expect("band lock poisoned");
        Ok(JobPriority::ALL
            .iter()
            .map(|priority| {
                let depth = bands[Self::band_index(*priority)].len() as u64;
                (*priority, depth)
            })
            .collect())
    }

    async fn update_limits(&self, max_cpu: u32, max_memory_mb: u64) -> Result<()> {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        if ledger.allocated_cpu != 0 || ledger.allocated_memory != 0 {
            bail!(
                "cannot resize ledger while {} cpu / {} MB are allocated",
                ledger.allocated_cpu,
                ledger.allocated_memory
            );
        }
        ledger.max_cpu = max_cpu;
        ledger.max_memory = max_memory_mb;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.bands
            .lock()
            .expect("band lock poisoned")
            .iter_mut()
            .for_each(VecDeque::clear);
        self.recently_completed
            .lock()
            .expect("side channel lock poisoned")
            .clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(priority: JobPriority, cpu: u32, mem: u64) -> QueueHandle {
        QueueHandle {
            job_id: Uuid::new_v4(),
            priority,
            cpu_units: cpu,
            memory_mb: mem,
        }
    }

    async fn queue(max_cpu: u32, max_mem: u64) -> InMemoryReadyQueue {
        let q = InMemoryReadyQueue::new();
        q.initialize(max_cpu, max_mem).await.unwrap();
        q
    }

    #[tokio::test]
    async fn pops_fifo_within_a_band() {
        let q = queue(8, 4096).await;
        let first = handle(JobPriority::Normal, 1, 64);
        let second = handle(JobPriority::Normal, 1, 64);
        q.push(first.clone()).await.unwrap();
        q.push(second.clone()).await.unwrap();

        let got = q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.job_id, first.job_id);
        let got = q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.job_id, second.job_id);
    }

    #[tokio::test]
    async fn pops_strict_priority_across_bands() {
        let q = queue(8, 4096).await;
        let low = handle(JobPriority::Low, 1, 64);
        let critical = handle(JobPriority::Critical, 1, 64);
        let normal = handle(JobPriority::Normal, 1, 64);
        q.push(low.clone()).await.unwrap();
        q.push(critical.clone()).await.unwrap();
        q.push(normal.clone()).await.unwrap();

        let order: Vec<Uuid> = [
            q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap(),
            q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap(),
            q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|h| h.job_id)
        .collect();
        assert_eq!(order, vec![critical.job_id, normal.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn oversized_head_goes_back_at_the_head() {
        let q = queue(8, 4096).await;
        let big = handle(JobPriority::Normal, 8, 4096);
        let small = handle(JobPriority::Normal, 1, 64);
        q.push(big.clone()).await.unwrap();
        q.push(small.clone()).await.unwrap();

        // Fill the ledger so nothing fits.
        assert!(q.try_allocate(8, 4096));
        assert!(q
            .try_pop_admissible(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        // After release the original head must still be first.
        q.release(8, 4096).await.unwrap();
        let got = q.try_pop_admissible(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.job_id, big.job_id);
    }

    #[tokio::test]
    async fn ledger_never_overshoots() {
        let q = queue(8, 4096).await;
        q.push(handle(JobPriority::Normal, 8, 4096)).await.unwrap();
        q.push(handle(JobPriority::Normal, 1, 64)).await.unwrap();

        let first = q.try_pop_admissible(Duration::ZERO).await.unwrap();
        assert!(first.is_some());
        // Second job fits the band but not the ledger.
        let second = q.try_pop_admissible(Duration::from_millis(10)).await.unwrap();
        assert!(second.is_none());

        let snapshot = q.resources().await.unwrap();
        assert_eq!(snapshot.allocated_cpu, 8);
        assert_eq!(snapshot.allocated_memory, 4096);
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let q = queue(8, 4096).await;
        q.release(4, 1024).await.unwrap();
        let snapshot = q.resources().await.unwrap();
        assert_eq!(snapshot.allocated_cpu, 0);
        assert_eq!(snapshot.allocated_memory, 0);
    }

    #[tokio::test]
    async fn drain_clears_the_side_channel() {
        let q = queue(8, 4096).await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.publish_completed(a).await.unwrap();
        q.publish_completed(b).await.unwrap();

        assert_eq!(q.drain_recently_completed().await.unwrap(), vec![a, b]);
        assert!(q.drain_recently_completed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_limits_refuses_while_allocated() {
        let q = queue(8, 4096).await;
        assert!(q.try_allocate(1, 64));
        assert!(q.update_limits(16, 8192).await.is_err());

        q.release(1, 64).await.unwrap();
        q.update_limits(16, 8192).await.unwrap();
        let snapshot = q.resources().await.unwrap();
        assert_eq!(snapshot.max_cpu, 16);
        assert_eq!(snapshot.max_memory, 8192);
    }

    #[tokio::test]
    async fn empty_pop_waits_for_a_push() {
        let q = std::sync::Arc::new(queue(8, 4096).await);
        let pusher = q.clone();
        let expected = handle(JobPriority::High, 1, 64);
        let pushed = expected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(pushed).await.unwrap();
        });

        let got = q
            .try_pop_admissible(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("push should wake the waiter");
        assert_eq!(got.job_id, expected.job_id);
    }
}
