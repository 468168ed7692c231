//! Engine: owns every collaborator and their lifecycle.
//!
//! Construction order is store → ledger/queue → dead-letter sink → event
//! bus → worker pool → resolver → dispatcher; teardown reverses it. There
//! are no process-wide singletons: everything lives here and is reachable
//! through the [`EngineHandle`].

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::admission::{
    AdmissionService, JobDetails, SubmittedJob, SystemHealth, SystemMetrics,
};
use crate::config::QueueConfig;
use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::dlq::{DeadLetterEntry, DeadLetterSink, DlqStats, InMemoryDeadLetterSink};
use crate::error::QueueError;
use crate::events::{EventBus, JobEvent};
use crate::job::{JobSpec, LogEntry};
use crate::queue::{InMemoryReadyQueue, QueueHandle, ReadyQueue, ResourceSnapshot};
use crate::registry::{HandlerRegistry, JobHandler};
use crate::resolver::DependencyResolver;
use crate::retry::{RetryEngine, RetryPolicy};
use crate::store::{JobFilter, StateStore};
use crate::worker::WorkerPool;

/// Assembles an [`Engine`]. The store backend is always explicit; queue and
/// dead-letter sink default to the in-memory implementations.
pub struct EngineBuilder {
    config: QueueConfig,
    store: Arc<dyn StateStore>,
    queue: Option<Arc<dyn ReadyQueue>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    registry: HandlerRegistry,
}

impl EngineBuilder {
    pub fn new(config: QueueConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            queue: None,
            dead_letters: None,
            registry: HandlerRegistry::new(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn ReadyQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Register a handler for a job type. Registration is static: nothing
    /// can be added once the engine is built.
    pub fn with_handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register(job_type, handler);
        self
    }

    pub fn with_fallback_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.registry = self.registry.with_fallback(handler);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(InMemoryReadyQueue::new())),
            dead_letters: self
                .dead_letters
                .unwrap_or_else(|| Arc::new(InMemoryDeadLetterSink::new())),
            config: self.config,
            store: self.store,
            registry: self.registry,
        }
    }
}

/// A fully wired but not yet running engine.
pub struct Engine {
    config: QueueConfig,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn ReadyQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    registry: HandlerRegistry,
}

impl Engine {
    /// Initialize the ledger, recover orphaned work, spawn the dispatcher,
    /// and hand back the operating handle.
    pub async fn start(self) -> Result<EngineHandle> {
        let Engine {
            config,
            store,
            queue,
            dead_letters,
            registry,
        } = self;

        queue
            .initialize(config.max_cpu_units, config.max_memory_mb)
            .await?;

        // Crash recovery: Running jobs with no live worker go back to
        // Pending (at-least-once; idempotency keys dedupe effects), and
        // Ready jobs are re-enqueued since the queue may have restarted
        // empty alongside us.
        let recovered = store.reset_orphaned_running(Utc::now()).await?;
        if recovered > 0 {
            info!(count = recovered, "recovered orphaned running jobs");
        }
        for job in store.find_ready_batch(u32::MAX).await? {
            queue.push(QueueHandle::for_job(&job)).await?;
        }

        let bus = EventBus::new();
        let shutdown = CancellationToken::new();
        let (pool, finished_rx) = WorkerPool::new(registry, shutdown.clone());
        let resolver = Arc::new(DependencyResolver::new(store.clone(), queue.clone()));
        let retry_engine = RetryEngine::new(
            store.clone(),
            queue.clone(),
            dead_letters.clone(),
            resolver.clone(),
            bus.clone(),
            RetryPolicy {
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            resolver.clone(),
            retry_engine,
            pool,
            finished_rx,
            bus.clone(),
            DispatcherConfig {
                max_concurrent_jobs: config.max_concurrent_jobs,
                tick: config.dispatcher_tick,
                backstop_interval: config.backstop_sweep_interval,
                shutdown_grace: config.shutdown_grace,
                ..DispatcherConfig::default()
            },
            shutdown.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let admission = AdmissionService::new(
            store.clone(),
            queue.clone(),
            dead_letters.clone(),
            resolver,
            bus.clone(),
        );
        bus.emit(JobEvent::System {
            event: "engine_started".to_string(),
            data: serde_json::json!({
                "max_concurrent_jobs": config.max_concurrent_jobs,
                "max_cpu_units": config.max_cpu_units,
                "max_memory_mb": config.max_memory_mb,
            }),
            timestamp: Utc::now(),
        });
        info!("engine started");

        Ok(EngineHandle {
            inner: Arc::new(HandleInner {
                admission,
                queue,
                bus,
                shutdown,
                dispatcher_task: Mutex::new(Some(dispatcher_task)),
            }),
        })
    }
}

struct HandleInner {
    admission: AdmissionService,
    queue: Arc<dyn ReadyQueue>,
    bus: EventBus,
    shutdown: CancellationToken,
    dispatcher_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl EngineHandle {
    pub async fn submit(&self, spec: JobSpec) -> Result<SubmittedJob, QueueError> {
        self.inner.admission.submit(spec).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobDetails, QueueError> {
        self.inner.admission.get(id).await
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<JobDetails>, u64), QueueError> {
        self.inner.admission.list(filter, page, per_page).await
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<(), QueueError> {
        self.inner.admission.cancel(id).await
    }

    pub async fn job_logs(&self, id: Uuid) -> Result<Vec<LogEntry>, QueueError> {
        self.inner.admission.logs(id).await
    }

    pub async fn add_dependency(&self, parent: Uuid, child: Uuid) -> Result<(), QueueError> {
        self.inner.admission.add_dependency(parent, child).await
    }

    pub async fn dead_letter_list(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<DeadLetterEntry>, u64), QueueError> {
        self.inner.admission.dead_letter_list(offset, limit).await
    }

    pub async fn dead_letter_stats(
        &self,
    ) -> Result<(DlqStats, Vec<DeadLetterEntry>), QueueError> {
        self.inner.admission.dead_letter_stats().await
    }

    pub async fn retry_from_dead_letter(&self, job_id: Uuid) -> Result<SubmittedJob, QueueError> {
        self.inner.admission.retry_from_dead_letter(job_id).await
    }

    pub async fn clear_dead_letters(&self, job_type: Option<&str>) -> Result<u64, QueueError> {
        self.inner.admission.clear_dead_letters(job_type).await
    }

    pub async fn metrics(&self) -> Result<SystemMetrics, QueueError> {
        self.inner.admission.metrics().await
    }

    pub async fn health(&self) -> SystemHealth {
        self.inner.admission.health().await
    }

    pub async fn resources(&self) -> Result<ResourceSnapshot, QueueError> {
        Ok(self.inner.queue.resources().await?)
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.inner.bus.subscribe()
    }

    /// Broadcast an operational event to subscribers.
    pub fn emit_system_event(&self, event: impl Into<String>, data: serde_json::Value) {
        self.inner.bus.emit(JobEvent::System {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        });
    }

    /// Stop intake, drain the dispatcher within its grace window, and wait
    /// for it to exit. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let task = self.inner.dispatcher_task.lock().await.take();
        if let Some(task) = task {
            task.await??;
        }
        info!("engine shut down");
        Ok(())
    }
}
