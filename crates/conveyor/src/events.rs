//! Lifecycle event broadcast.
//!
//! The bus carries facts about jobs to live subscribers. Delivery is
//! best-effort and at-most-once: events are not persisted, ordering holds
//! per subscriber, and a lagged receiver gets a lag error instead of
//! backpressuring the dispatcher. Durable state lives in the store, never
//! here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{Job, JobPriority};

/// Default subscriber buffer before a slow receiver starts lagging.
const EVENT_BUFFER: usize = 256;

/// Facts about the job lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job was admitted.
    Created {
        job_id: Uuid,
        job_type: String,
        priority: JobPriority,
        timestamp: DateTime<Utc>,
    },

    /// Execution began.
    Started {
        job_id: Uuid,
        job_type: String,
        priority: JobPriority,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Execution finished successfully.
    Completed {
        job_id: Uuid,
        result: Value,
        timestamp: DateTime<Utc>,
    },

    /// A failed attempt was rescheduled.
    RetryScheduled {
        job_id: Uuid,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The job reached a permanent failure state.
    Failed {
        job_id: Uuid,
        error: String,
        final_attempt: bool,
        timestamp: DateTime<Utc>,
    },

    /// The job was cancelled before running.
    Cancelled {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Operational broadcast not tied to one job.
    System {
        event: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => Some(*job_id),
            JobEvent::System { .. } => None,
        }
    }

    /// Short wire name, e.g. `job_started`.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "job_created",
            JobEvent::Started { .. } => "job_started",
            JobEvent::Completed { .. } => "job_completed",
            JobEvent::RetryScheduled { .. } => "job_retry_scheduled",
            JobEvent::Failed { .. } => "job_failed",
            JobEvent::Cancelled { .. } => "job_cancelled",
            JobEvent::System { .. } => "system_event",
        }
    }

    pub fn started(job: &Job, now: DateTime<Utc>) -> Self {
        JobEvent::Started {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            attempt: job.attempt_number(),
            timestamp: now,
        }
    }
}

/// Broadcast fan-out to live subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. A bus with no subscribers swallows it.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
