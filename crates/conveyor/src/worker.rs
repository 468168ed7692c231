//! Worker pool: bounded concurrent execution with hard deadlines.
//!
//! Every job runs inside `tokio::time::timeout(job.timeout_seconds)`; the
//! deadline is the primary timeout enforcement, the dispatcher's sweep is
//! the backstop. Finished work is reported over a channel rather than
//! awaited, so the dispatcher tick never blocks on a handler.
//!
//! Removal from the running map is the commit point for reporting: whoever
//! removes the entry (the worker task on completion, or the sweep on a lost
//! deadline) is the one that reports, so a job finishes exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::job::Job;
use crate::registry::{HandlerContext, HandlerRegistry};

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Value),
    Failure {
        message: String,
        traceback: Option<String>,
    },
    /// The hard deadline fired before the handler returned.
    Timeout,
}

/// Who ran the job; recorded on every execution row.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub hostname: String,
}

impl WorkerIdentity {
    pub fn generate() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

/// A completed attempt, reported back to the dispatcher.
#[derive(Debug)]
pub struct FinishedJob {
    pub job: Job,
    pub execution_id: Uuid,
    pub cpu_units: u32,
    pub memory_mb: u64,
    pub outcome: Outcome,
}

struct RunningEntry {
    job: Job,
    execution_id: Uuid,
    cpu_units: u32,
    memory_mb: u64,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

struct PoolInner {
    registry: HandlerRegistry,
    running: DashMap<Uuid, RunningEntry>,
    finished_tx: mpsc::UnboundedSender<FinishedJob>,
}

impl PoolInner {
    /// Report an outcome for a job, if it is still ours to report.
    fn report(&self, job_id: Uuid, outcome: Outcome) {
        let Some((_, entry)) = self.running.remove(&job_id) else {
            // Already reported by the timeout sweep.
            return;
        };
        let finished = FinishedJob {
            job: entry.job,
            execution_id: entry.execution_id,
            cpu_units: entry.cpu_units,
            memory_mb: entry.memory_mb,
            outcome,
        };
        if self.finished_tx.send(finished).is_err() {
            error!(job_id = %job_id, "dispatcher gone, dropping job outcome");
        }
    }
}

/// Concurrency-limited executor for claimed jobs.
///
/// The pool itself does not enforce the limit; the dispatcher checks
/// `running_count()` before admitting, which keeps admission and the bound
/// under a single writer.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    identity: WorkerIdentity,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Build a pool and the channel the dispatcher reaps outcomes from.
    pub fn new(
        registry: HandlerRegistry,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<FinishedJob>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let pool = Self {
            inner: Arc::new(PoolInner {
                registry,
                running: DashMap::new(),
                finished_tx,
            }),
            identity: WorkerIdentity::generate(),
            shutdown,
        };
        (pool, finished_rx)
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.running.is_empty()
    }

    /// Launch a job. The ledger allocation travels with the entry so release
    /// happens exactly once, when the outcome is handled.
    pub fn spawn(&self, job: Job, execution_id: Uuid, started_at: DateTime<Utc>) {
        let job_id = job.id;
        let cancel = self.shutdown.child_token();
        let entry = RunningEntry {
            job: job.clone(),
            execution_id,
            cpu_units: job.cpu_units,
            memory_mb: job.memory_mb,
            started_at,
            cancel: cancel.clone(),
            abort: None,
        };
        self.inner.running.insert(job_id, entry);

        let handler = self.inner.registry.resolve(&job.job_type);
        let ctx = HandlerContext {
            job_id,
            job_type: job.job_type.clone(),
            attempt: job.attempt_number(),
            cancel,
        };
        let deadline = Duration::from_secs(job.timeout_seconds);
        let payload = job.payload.clone();
        let inner = self.inner.clone();

        let handle = tokio::spawn(async move {
            let outcome =
                match tokio::time::timeout(deadline, handler.execute(&payload, &ctx)).await {
                    Ok(Ok(result)) => Outcome::Success(result),
                    Ok(Err(err)) => Outcome::Failure {
                        message: err.to_string(),
                        traceback: Some(format!("{err:?}")),
                    },
                    Err(_) => {
                        // Best-effort cancel of whatever the handler left in flight.
                        ctx.cancel.cancel();
                        Outcome::Timeout
                    }
                };
            inner.report(job_id, outcome);
        });

        if let Some(mut entry) = self.inner.running.get_mut(&job_id) {
            entry.abort = Some(handle.abort_handle());
        }
        debug!(job_id = %job_id, "worker task launched");
    }

    /// Running jobs whose deadline (plus `grace`) has passed without a
    /// reported outcome.
    pub fn overdue(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Uuid> {
        self.inner
            .running
            .iter()
            .filter(|entry| {
                let budget = Duration::from_secs(entry.job.timeout_seconds) + grace;
                now.signed_duration_since(entry.started_at).num_seconds() > budget.as_secs() as i64
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Backstop for a lost deadline: abort the task and synthesize the
    /// Timeout outcome the task can no longer deliver.
    pub fn force_timeout(&self, job_id: Uuid) {
        let Some((_, entry)) = self.inner.running.remove(&job_id) else {
            return;
        };
        entry.cancel.cancel();
        if let Some(abort) = entry.abort {
            abort.abort();
        }
        let finished = FinishedJob {
            job: entry.job,
            execution_id: entry.execution_id,
            cpu_units: entry.cpu_units,
            memory_mb: entry.memory_mb,
            outcome: Outcome::Timeout,
        };
        let _ = self.inner.finished_tx.send(finished);
    }

    /// Ask every running handler to stop (shutdown path). Tasks report
    /// normally once their handler returns or their deadline fires.
    pub fn cancel_all(&self) {
        for entry in self.inner.running.iter() {
            entry.cancel.cancel();
        }
    }

    /// Hard-stop everything still running after the shutdown grace window.
    ///
    /// No outcome is synthesized: the jobs stay Running in the store and
    /// crash recovery re-admits them at next startup. Returns the ledger
    /// allocations so the caller can drain the ledger to zero.
    pub fn abort_remaining(&self) -> Vec<(u32, u64)> {
        let ids: Vec<Uuid> = self.inner.running.iter().map(|e| *e.key()).collect();
        let mut allocations = Vec::with_capacity(ids.len());
        for job_id in ids {
            let Some((_, entry)) = self.inner.running.remove(&job_id) else {
                continue;
            };
            entry.cancel.cancel();
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            allocations.push((entry.cpu_units, entry.memory_mb));
        }
        allocations
    }
}
