//! Handler registry: job type → executable capability.
//!
//! Handlers are registered once, at engine build time; there is no dynamic
//! registration afterwards. Unknown types fall back to the designated
//! generic handler, so admission never has to know the handler set.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Per-run context passed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: Uuid,
    pub job_type: String,
    /// 1-based attempt label.
    pub attempt: u32,
    /// Cooperative cancellation; fired on shutdown. Long handlers should
    /// select against it between units of work.
    pub cancel: CancellationToken,
}

/// A job-type capability. Handlers are pure consumers of the payload; any
/// side effects are their own responsibility. Errors feed the retry engine,
/// never the submitter.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value>;
}

/// Blanket impl so plain async closures can register without a newtype.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

/// Static mapping from job type to handler, with a generic fallback.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Arc<dyn JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(GenericHandler),
        }
    }

    /// Replace the unknown-type fallback.
    pub fn with_fallback(mut self, fallback: Arc<dyn JobHandler>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Resolve a handler; unknown types get the generic fallback.
    pub fn resolve(&self, job_type: &str) -> Arc<dyn JobHandler> {
        match self.handlers.get(job_type) {
            Some(handler) => handler.clone(),
            None => {
                warn!(job_type, "no handler registered, using generic fallback");
                self.fallback.clone()
            }
        }
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback for job types nothing claimed: acknowledges the payload so the
/// job still completes instead of dead-lettering on typos.
struct GenericHandler;

#[async_trait]
impl JobHandler for GenericHandler {
    async fn execute(&self, _payload: &Value, ctx: &HandlerContext) -> Result<Value> {
        Ok(serde_json::json!({
            "generic_job_completed": true,
            "job_type": ctx.job_type,
            "note": format!("Generic handler executed for {}", ctx.job_type),
        }))
    }
}
