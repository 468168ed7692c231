//! Engine harness over in-memory backends with millisecond pacing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use uuid::Uuid;

use conveyor_core::{
    DeadLetterSink, EngineBuilder, EngineHandle, InMemoryDeadLetterSink, InMemoryReadyQueue,
    Job, JobHandler, JobStatus, QueueConfig,
};

use crate::store::MemoryStateStore;

/// A [`QueueConfig`] paced for tests: fast ticks, short backoff, quick
/// shutdown. Resource and concurrency limits keep the production defaults.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        dispatcher_tick: Duration::from_millis(10),
        retry_base_delay: Duration::from_millis(50),
        retry_max_delay: Duration::from_millis(400),
        backstop_sweep_interval: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        ..QueueConfig::default()
    }
}

/// Builds a [`TestHarness`].
pub struct TestHarnessBuilder {
    config: QueueConfig,
    handlers: Vec<(String, Arc<dyn JobHandler>)>,
}

impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((job_type.into(), handler));
        self
    }

    pub async fn start(self) -> Result<TestHarness> {
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(InMemoryReadyQueue::new());
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

        let mut builder = EngineBuilder::new(self.config, store.clone())
            .with_queue(queue.clone())
            .with_dead_letters(dead_letters.clone() as Arc<dyn DeadLetterSink>);
        for (job_type, handler) in self.handlers {
            builder = builder.with_handler(job_type, handler);
        }

        let handle = builder.build().start().await?;
        Ok(TestHarness {
            handle,
            store,
            queue,
            dead_letters,
        })
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running engine plus direct access to its in-memory backends for
/// assertions.
pub struct TestHarness {
    pub handle: EngineHandle,
    pub store: Arc<MemoryStateStore>,
    pub queue: Arc<InMemoryReadyQueue>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
}

impl TestHarness {
    /// Poll until the job reaches `status` or the deadline passes.
    pub async fn wait_for_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        deadline: Duration,
    ) -> Result<Job> {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(job) = self.store.job(job_id) {
                if job.status == status {
                    return Ok(job);
                }
                if job.status.is_terminal() && job.status != status {
                    bail!(
                        "job {job_id} settled at {} while waiting for {status}",
                        job.status
                    );
                }
            }
            if tokio::time::Instant::now() >= end {
                let current = self.store.job(job_id).map(|j| j.status);
                bail!("job {job_id} never reached {status} (last seen: {current:?})");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the job reaches any terminal status.
    pub async fn wait_for_terminal(&self, job_id: Uuid, deadline: Duration) -> Result<Job> {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(job) = self.store.job(job_id) {
                if job.status.is_terminal() {
                    return Ok(job);
                }
            }
            if tokio::time::Instant::now() >= end {
                let current = self.store.job(job_id).map(|j| j.status);
                bail!("job {job_id} never settled (last seen: {current:?})");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
