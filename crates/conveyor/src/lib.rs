//! # Conveyor
//!
//! A priority-aware, resource-constrained job queue engine: jobs are
//! admitted, ordered, dispatched, retried and reported on until each one
//! reaches a terminal state.
//!
//! ## Architecture
//!
//! ```text
//! Edge (HTTP/WebSocket)
//!     │
//!     ▼ submit()
//! AdmissionService ──► StateStore (durable jobs, edges, attempts, logs)
//!     │                     ▲
//!     ▼ push()              │ set_status / scans
//! ReadyQueue ◄──────── Dispatcher loop ─────► EventBus ──► subscribers
//!  (4 bands + ledger)       │    ▲
//!     │ try_pop_admissible  │    │ outcomes
//!     ▼                     ▼    │
//!            WorkerPool (deadline-bounded tasks)
//!                           │
//!                           ▼
//!            RetryEngine ──► backoff / DeadLetterSink
//!                           │
//!                           ▼
//!            DependencyResolver (promote / cascade-fail dependents)
//! ```
//!
//! ## Key invariants
//!
//! 1. **Terminal statuses are sinks** - Completed/Failed/Cancelled/Timeout
//!    are never left
//! 2. **Ready requires satisfied parents** - a child never runs before every
//!    parent Completed
//! 3. **The ledger never overshoots** - admission is an atomic
//!    check-and-deduct against configured maxima
//! 4. **At-least-once execution** - crash recovery re-admits orphaned work;
//!    idempotency keys dedupe effects
//! 5. **Events are facts** - best-effort, at-most-once, never durable state
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_core::{EngineBuilder, JobSpec, JobPriority, QueueConfig};
//!
//! let engine = EngineBuilder::new(QueueConfig::from_env(), store)
//!     .with_handler("send_email", email_handler)
//!     .build();
//! let handle = engine.start().await?;
//!
//! let submitted = handle
//!     .submit(JobSpec::new("send_email").priority(JobPriority::High))
//!     .await?;
//! println!("queued at position {:?}", submitted.details.position_in_queue);
//! ```
//!
//! Durable state lives in a [`store::StateStore`] (Postgres in
//! `conveyor-store-postgres`); the ready queue, ledger and dead-letter sink
//! run in-process by default or on Redis (`conveyor-queue-redis`) when
//! several worker processes share one queue.

// Core modules
mod admission;
mod config;
mod dispatch;
mod dlq;
mod engine;
mod error;
mod events;
mod job;
mod queue;
mod registry;
mod resolver;
mod retry;
mod store;
mod worker;

// Re-export the job model
pub use crate::job::{
    ExecutionRecord, ExecutionStatus, Job, JobPriority, JobSpec, JobStatus, LogEntry, LogLevel,
    MAX_DEPENDENCIES, MAX_IDEMPOTENCY_KEY_LEN, MAX_TYPE_LEN,
};

// Re-export error types
pub use crate::error::QueueError;

// Re-export configuration
pub use crate::config::QueueConfig;

// Re-export store contract
pub use crate::store::{CreateOutcome, JobFilter, NewExecution, StateStore, StatusPatch};

// Re-export queue contract and in-memory backend
pub use crate::queue::{InMemoryReadyQueue, QueueHandle, ReadyQueue, ResourceSnapshot};

// Re-export dead-letter contract and in-memory backend
pub use crate::dlq::{DeadLetterEntry, DeadLetterSink, DlqStats, InMemoryDeadLetterSink};

// Re-export events
pub use crate::events::{EventBus, JobEvent};

// Re-export handler seam
pub use crate::registry::{FnHandler, HandlerContext, HandlerRegistry, JobHandler};

// Re-export resolver (graph queries)
pub use crate::resolver::{DependencyResolver, DEPENDENCY_FAILED_ERROR};

// Re-export retry policy
pub use crate::retry::RetryPolicy;

// Re-export worker types
pub use crate::worker::{FinishedJob, Outcome, WorkerIdentity, WorkerPool};

// Re-export dispatcher configuration
pub use crate::dispatch::{Dispatcher, DispatcherConfig};

// Re-export admission service types
pub use crate::admission::{
    AdmissionService, JobDetails, SubmittedJob, SystemHealth, SystemMetrics,
};

// Re-export engine types (primary entry point)
pub use crate::engine::{Engine, EngineBuilder, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
