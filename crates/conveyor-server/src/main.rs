//! Conveyor server binary: Postgres store + Redis queue + engine + HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conveyor_core::{EngineBuilder, QueueConfig};
use conveyor_queue_redis::{connect, RedisDeadLetterSink, RedisReadyQueue};
use conveyor_server::{register_demo_handlers, router};
use conveyor_store_postgres::PgStateStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = QueueConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(environment = %config.environment, "starting conveyor server");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = PgStateStore::new(pool);
    store.init_schema().await?;

    let redis = connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let queue = RedisReadyQueue::new(redis.clone());
    let dead_letters = RedisDeadLetterSink::new(redis);

    let engine = register_demo_handlers(EngineBuilder::new(config, Arc::new(store)))
        .with_queue(Arc::new(queue))
        .with_dead_letters(Arc::new(dead_letters))
        .build();
    let handle = engine.start().await?;

    let app = router(handle.clone());
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    handle.shutdown().await?;
    info!("conveyor server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}
