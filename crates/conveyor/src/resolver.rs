//! Dependency resolver: graph queries over the state store.
//!
//! The dependency graph is a DAG, enforced here at edge insertion. All
//! traversals are iterative with explicit visited sets so deep or wide
//! graphs never grow the call stack.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use smallvec::SmallVec;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{Job, JobStatus, LogLevel};
use crate::queue::{QueueHandle, ReadyQueue};
use crate::store::{StateStore, StatusPatch};

/// Error recorded on every job failed by a parent's permanent failure.
pub const DEPENDENCY_FAILED_ERROR: &str = "Dependency job failed";

/// Graph queries and the blocked → ready / blocked → failed transitions.
pub struct DependencyResolver {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ReadyQueue>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn ReadyQueue>) -> Self {
        Self { store, queue }
    }

    /// Would adding edges `proposed_parents → candidate_child` close a
    /// cycle? True iff the child is reachable from any proposed parent by
    /// following existing child edges.
    pub async fn would_create_cycle(
        &self,
        candidate_child: Uuid,
        proposed_parents: &[Uuid],
    ) -> Result<bool> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut stack: SmallVec<[Uuid; 8]> = SmallVec::new();

        for parent in proposed_parents {
            if *parent == candidate_child {
                return Ok(true);
            }
            if visited.insert(*parent) {
                stack.push(*parent);
            }
        }

        while let Some(node) = stack.pop() {
            for child in self.store.children_of(node).await? {
                if child == candidate_child {
                    return Ok(true);
                }
                if visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        Ok(false)
    }

    /// Record an edge, rejecting cycles before anything is written.
    pub async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<(), QueueError> {
        if self
            .would_create_cycle(child, std::slice::from_ref(&parent))
            .await?
        {
            return Err(QueueError::CycleDetected);
        }
        self.store.add_dependency(parent, child).await?;
        Ok(())
    }

    /// True iff every parent of `job_id` is Completed (vacuously true with
    /// no parents).
    pub async fn are_parents_satisfied(&self, job_id: Uuid) -> Result<bool> {
        let statuses = self.store.parent_statuses(job_id).await?;
        Ok(statuses.iter().all(|s| *s == JobStatus::Completed))
    }

    /// Promote every Blocked direct child of `parent_id` whose parents are
    /// all Completed: Ready in the store, then onto the queue. Idempotent;
    /// returns how many jobs were promoted.
    pub async fn promote_dependents_of(&self, parent_id: Uuid) -> Result<u64> {
        let mut promoted = 0;
        for child in self.store.blocked_children_of(parent_id).await? {
            if self.are_parents_satisfied(child.id).await? {
                promoted += u64::from(self.promote(&child).await?);
            }
        }
        Ok(promoted)
    }

    /// Blocked → Ready for one job, plus the enqueue. Returns false when the
    /// job moved on concurrently (the store refuses the transition).
    pub async fn promote(&self, job: &Job) -> Result<bool> {
        let changed = self
            .store
            .set_status(job.id, JobStatus::Ready, StatusPatch::default())
            .await?;
        if !changed {
            return Ok(false);
        }
        self.queue.push(QueueHandle::for_job(job)).await?;
        self.store
            .append_log(
                job.id,
                LogLevel::Info,
                "Job unblocked - all dependencies satisfied",
                "scheduler",
            )
            .await?;
        debug!(job_id = %job.id, "promoted blocked job to ready");
        Ok(true)
    }

    /// Fail the whole downstream closure of `parent_id`: every non-terminal
    /// descendant becomes Failed with [`DEPENDENCY_FAILED_ERROR`]. Iterative
    /// breadth-first walk; the visited set bounds work on wide fan-outs.
    /// Returns the ids that were failed, in visit order.
    pub async fn fail_dependents_of(&self, parent_id: Uuid) -> Result<Vec<Uuid>> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut frontier: SmallVec<[Uuid; 8]> = SmallVec::new();
        let mut failed = Vec::new();
        visited.insert(parent_id);
        frontier.push(parent_id);

        while let Some(node) = frontier.pop() {
            for child in self.store.children_of(node).await? {
                if !visited.insert(child) {
                    continue;
                }
                // Terminal children are left untouched: the store refuses
                // the write, and their subtree is still walked via the
                // frontier so grandchildren settle too.
                let changed = self
                    .store
                    .set_status(
                        child,
                        JobStatus::Failed,
                        StatusPatch::error(DEPENDENCY_FAILED_ERROR),
                    )
                    .await?;
                if changed {
                    self.store
                        .append_log(
                            child,
                            LogLevel::Error,
                            &format!("Job failed due to dependency job {node} failure"),
                            "resolver",
                        )
                        .await?;
                    failed.push(child);
                }
                frontier.push(child);
            }
        }

        if !failed.is_empty() {
            info!(
                parent_id = %parent_id,
                count = failed.len(),
                "failed dependents of permanently failed job"
            );
        }
        Ok(failed)
    }

    /// Rate-limited backstop for lost promotion signals: re-check every
    /// Blocked job directly. Also settles jobs blocked on a parent that
    /// already failed terminally before they could be cascaded.
    pub async fn sweep_blocked(&self, limit: u32) -> Result<()> {
        for job in self.store.find_blocked(limit).await? {
            let statuses = self.store.parent_statuses(job.id).await?;
            if statuses.iter().all(|s| *s == JobStatus::Completed) {
                self.promote(&job).await?;
            } else if statuses.iter().any(|s| {
                matches!(
                    s,
                    JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
                )
            }) {
                let changed = self
                    .store
                    .set_status(
                        job.id,
                        JobStatus::Failed,
                        StatusPatch::error(DEPENDENCY_FAILED_ERROR),
                    )
                    .await?;
                if changed {
                    self.store
                        .append_log(
                            job.id,
                            LogLevel::Error,
                            "Job failed - a dependency finished without completing",
                            "resolver",
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}
