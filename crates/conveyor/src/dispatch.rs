//! Dispatcher: the single-writer scheduling loop.
//!
//! One cooperative task ties the store, queue, resolver, worker pool and
//! retry engine together. Each tick: drain completion signals and promote
//! dependents, reap finished workers, re-admit due retries, admit ready
//! work while capacity and resources allow, sweep for lost timeouts, and
//! periodically run the blocked-job backstop. Any non-invariant error in a
//! tick is logged and the loop continues with a longer pause.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, JobEvent};
use crate::job::{JobStatus, LogLevel};
use crate::queue::{QueueHandle, ReadyQueue};
use crate::resolver::DependencyResolver;
use crate::retry::RetryEngine;
use crate::store::{NewExecution, StateStore, StatusPatch};
use crate::worker::{FinishedJob, WorkerPool};

/// Pacing knobs for the loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: usize,
    /// Sleep between ticks.
    pub tick: Duration,
    /// How long one admission attempt may wait on an empty queue.
    pub pop_timeout: Duration,
    /// Rows fetched per retry / backstop scan.
    pub scan_limit: u32,
    /// How often the blocked-job backstop sweep runs.
    pub backstop_interval: Duration,
    /// Slack added to a job's deadline before the sweep forces a timeout.
    pub timeout_grace: Duration,
    /// Bounded wait for running jobs at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            tick: Duration::from_secs(1),
            pop_timeout: Duration::from_millis(200),
            scan_limit: 100,
            backstop_interval: Duration::from_secs(30),
            timeout_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// The scheduling loop. Owns the outcome channel end of the worker pool;
/// everything else is shared.
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ReadyQueue>,
    resolver: Arc<DependencyResolver>,
    retry_engine: RetryEngine,
    pool: WorkerPool,
    finished_rx: mpsc::UnboundedReceiver<FinishedJob>,
    bus: EventBus,
    config: DispatcherConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn ReadyQueue>,
        resolver: Arc<DependencyResolver>,
        retry_engine: RetryEngine,
        pool: WorkerPool,
        finished_rx: mpsc::UnboundedReceiver<FinishedJob>,
        bus: EventBus,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            retry_engine,
            pool,
            finished_rx,
            bus,
            config,
            shutdown,
        }
    }

    /// Run until shutdown is requested, then drain cooperatively.
    pub async fn run(mut self) -> Result<()> {
        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            tick_ms = self.config.tick.as_millis() as u64,
            "dispatcher started"
        );
        let mut last_backstop = tokio::time::Instant::now();

        while !self.shutdown.is_cancelled() {
            let pause = match self.tick(&mut last_backstop).await {
                Ok(()) => self.config.tick,
                Err(err) => {
                    error!(error = ?err, "error in dispatcher tick");
                    self.config.tick * 5
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.drain_on_shutdown().await;
        info!("dispatcher stopped");
        Ok(())
    }

    async fn tick(&mut self, last_backstop: &mut tokio::time::Instant) -> Result<()> {
        self.promote_recently_completed().await?;
        self.reap_finished().await;
        self.admit_due_retries().await?;
        self.admit_ready().await?;
        self.sweep_timeouts().await;

        if last_backstop.elapsed() >= self.config.backstop_interval {
            *last_backstop = tokio::time::Instant::now();
            self.resolver.sweep_blocked(self.config.scan_limit).await?;
        }
        Ok(())
    }

    /// Step 1: every terminal finish published since the last tick unblocks
    /// only the direct children of that job.
    async fn promote_recently_completed(&self) -> Result<()> {
        for parent_id in self.queue.drain_recently_completed().await? {
            self.resolver.promote_dependents_of(parent_id).await?;
        }
        Ok(())
    }

    /// Step 2: settle every outcome the pool has reported.
    async fn reap_finished(&mut self) {
        while let Ok(finished) = self.finished_rx.try_recv() {
            let job_id = finished.job.id;
            if let Err(err) = self.retry_engine.handle_outcome(finished).await {
                // The job stays in its current state; the retry scan or the
                // operator picks it up.
                error!(job_id = %job_id, error = ?err, "failed to settle job outcome");
            }
        }
    }

    /// Step 3: Pending jobs whose backoff has elapsed re-enter through the
    /// readiness check.
    async fn admit_due_retries(&self) -> Result<()> {
        let now = Utc::now();
        for job in self
            .store
            .find_due_retries(now, self.config.scan_limit)
            .await?
        {
            if self.resolver.are_parents_satisfied(job.id).await? {
                let changed = self
                    .store
                    .set_status(job.id, JobStatus::Ready, StatusPatch::default())
                    .await?;
                if changed {
                    self.queue.push(QueueHandle::for_job(&job)).await?;
                    debug!(job_id = %job.id, attempt = job.attempt_number(), "retry admitted");
                }
            } else {
                // A parent regressed or is still in flight; wait for the
                // promotion path instead of spinning on the retry scan.
                self.store
                    .set_status(job.id, JobStatus::Blocked, StatusPatch::default())
                    .await?;
            }
        }
        Ok(())
    }

    /// Step 4: pull admissible work while the pool has capacity.
    async fn admit_ready(&self) -> Result<()> {
        while self.pool.running_count() < self.config.max_concurrent_jobs {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let Some(handle) = self.queue.try_pop_admissible(self.config.pop_timeout).await?
            else {
                return Ok(());
            };
            self.start_job(handle).await?;
        }
        Ok(())
    }

    /// The pop already deducted the ledger; the job runs only if it is
    /// still Ready when re-read, otherwise the allocation goes straight
    /// back (cancelled jobs, duplicate enqueues).
    async fn start_job(&self, handle: QueueHandle) -> Result<()> {
        let job = self.store.get_job(handle.job_id).await?;
        let job = match job {
            Some(job) if job.status == JobStatus::Ready => job,
            other => {
                debug!(
                    job_id = %handle.job_id,
                    status = ?other.map(|j| j.status),
                    "dropping stale queue handle"
                );
                self.queue
                    .release(handle.cpu_units, handle.memory_mb)
                    .await?;
                return Ok(());
            }
        };

        let now = Utc::now();
        let changed = self
            .store
            .set_status(job.id, JobStatus::Running, StatusPatch::default())
            .await?;
        if !changed {
            self.queue
                .release(handle.cpu_units, handle.memory_mb)
                .await?;
            return Ok(());
        }

        let identity = self.pool.identity().clone();
        let execution_id = self
            .store
            .append_execution(NewExecution {
                job_id: job.id,
                attempt_number: job.attempt_number(),
                worker_id: identity.worker_id,
                worker_hostname: identity.hostname,
                started_at: now,
            })
            .await?;
        self.store
            .append_log(
                job.id,
                LogLevel::Info,
                &format!(
                    "Job started (attempt {}/{})",
                    job.attempt_number(),
                    job.max_attempts
                ),
                "scheduler",
            )
            .await?;

        self.bus.emit(JobEvent::started(&job, now));
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "started job"
        );
        self.pool.spawn(job, execution_id, now);
        Ok(())
    }

    /// Step 5: belt-and-braces for deadlines whose firing was lost.
    async fn sweep_timeouts(&self) {
        for job_id in self.pool.overdue(Utc::now(), self.config.timeout_grace) {
            warn!(job_id = %job_id, "deadline lost, forcing timeout");
            self.pool.force_timeout(job_id);
        }
    }

    /// Shutdown: no new admissions (the loop has exited), cancel handlers
    /// cooperatively, settle what finishes inside the grace window, then
    /// abort stragglers and hand their allocations back so the ledger drains
    /// to zero. Jobs still Running in the store are reset by crash recovery
    /// at next startup.
    async fn drain_on_shutdown(&mut self) {
        let running = self.pool.running_count();
        if running > 0 {
            info!(count = running, "waiting for running jobs to finish");
        }
        self.pool.cancel_all();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.pool.is_idle() || !self.finished_rx.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining.min(Duration::from_millis(100)), self.finished_rx.recv()).await {
                Ok(Some(finished)) => {
                    let job_id = finished.job.id;
                    if let Err(err) = self.retry_engine.handle_outcome(finished).await {
                        error!(job_id = %job_id, error = ?err, "failed to settle outcome during shutdown");
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }

        for (cpu_units, memory_mb) in self.pool.abort_remaining() {
            if let Err(err) = self.queue.release(cpu_units, memory_mb).await {
                error!(error = ?err, "failed to release allocation during shutdown");
            }
        }

        self.bus.emit(JobEvent::System {
            event: "dispatcher_stopped".to_string(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        });
    }
}
