//! Redis implementation of the Conveyor ready queue, resource ledger and
//! dead-letter sink.
//!
//! Multiple worker processes share one queue by pointing at the same Redis:
//! four priority lists (`queue:critical` … `queue:low`), four ledger
//! counters (`resources:*`), a short-TTL list of recently completed job ids,
//! and the dead-letter list plus its stats hash.
//!
//! The ledger's check-and-deduct and saturating release run as single Lua
//! scripts, which makes them linearizable against every other client without
//! a WATCH/MULTI retry loop. Transient connection errors are retried
//! internally with bounded backoff before they surface.

mod dlq;
mod queue;

pub use dlq::RedisDeadLetterSink;
pub use queue::RedisReadyQueue;

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::time::sleep;
use tracing::warn;

/// Attempts per operation before a transient error surfaces.
const TRANSIENT_ATTEMPTS: u32 = 3;
/// Base pause between transient-error retries (scales linearly).
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// Open a managed connection (auto-reconnecting) to the shared store.
pub async fn connect(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
}

/// Run a Redis operation, retrying transient failures with bounded backoff.
async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> redis::RedisResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = redis::RedisResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < TRANSIENT_ATTEMPTS && is_transient(&err) => {
                attempt += 1;
                warn!(op = op_name, attempt, error = %err, "transient redis error, retrying");
                sleep(TRANSIENT_BACKOFF * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_backoff_passes_through_success() {
        let result: redis::RedisResult<u32> = with_backoff("probe", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn with_backoff_surfaces_non_transient_errors_immediately() {
        let mut calls = 0;
        let result: redis::RedisResult<u32> = with_backoff("probe", || {
            calls += 1;
            async {
                Err(redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "wrong type",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
