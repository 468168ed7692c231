//! Deterministic handler doubles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use conveyor_core::{HandlerContext, JobHandler};

/// Succeeds after an optional simulated work delay.
pub struct SucceedingHandler {
    pub delay: Duration,
    pub result: Value,
}

impl SucceedingHandler {
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
            result: serde_json::json!({"ok": true}),
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            result: serde_json::json!({"ok": true}),
        }
    }
}

#[async_trait]
impl JobHandler for SucceedingHandler {
    async fn execute(&self, _payload: &Value, _ctx: &HandlerContext) -> Result<Value> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.result.clone())
    }
}

/// Always fails with the given message.
pub struct FailingHandler {
    pub message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, _payload: &Value, _ctx: &HandlerContext) -> Result<Value> {
        Err(anyhow!("{}", self.message))
    }
}

/// Fails the first `n` executions, then succeeds.
pub struct FailNTimesHandler {
    remaining_failures: AtomicU32,
    pub message: String,
}

impl FailNTimesHandler {
    pub fn new(n: u32, message: impl Into<String>) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
            message: message.into(),
        }
    }
}

#[async_trait]
impl JobHandler for FailNTimesHandler {
    async fn execute(&self, _payload: &Value, _ctx: &HandlerContext) -> Result<Value> {
        let before = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if before > 0 {
            Err(anyhow!("{}", self.message))
        } else {
            Ok(serde_json::json!({"recovered": true}))
        }
    }
}

/// Never returns on its own; exits only through the deadline or
/// cancellation. Exercises timeout and shutdown paths.
pub struct NeverFinishHandler;

#[async_trait]
impl JobHandler for NeverFinishHandler {
    async fn execute(&self, _payload: &Value, ctx: &HandlerContext) -> Result<Value> {
        ctx.cancel.cancelled().await;
        Err(anyhow!("cancelled"))
    }
}

/// Records how many times it ran; succeeds every time.
#[derive(Default)]
pub struct CountingHandler {
    runs: AtomicU32,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn execute(&self, _payload: &Value, _ctx: &HandlerContext) -> Result<Value> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(serde_json::json!({"run": run}))
    }
}
