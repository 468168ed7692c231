//! Simulated per-type handlers for demonstration deployments.
//!
//! Each one sleeps for a plausible amount of time and returns a JSON
//! summary shaped like the real integration would produce. Production
//! deployments replace these with their own registrations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use conveyor_core::{EngineBuilder, FnHandler, HandlerContext};

/// Register the demo handler set on an engine builder.
pub fn register_demo_handlers(builder: EngineBuilder) -> EngineBuilder {
    builder
        .with_handler("send_email", Arc::new(FnHandler(send_email)))
        .with_handler("data_export", Arc::new(FnHandler(data_export)))
        .with_handler("data_fetch", Arc::new(FnHandler(data_fetch)))
        .with_handler("data_processing", Arc::new(FnHandler(data_processing)))
        .with_handler("report_generation", Arc::new(FnHandler(report_generation)))
        .with_handler("generate_report", Arc::new(FnHandler(report_generation)))
}

async fn send_email(payload: Value, ctx: HandlerContext) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(json!({
        "email_sent": true,
        "recipient": payload.get("to").cloned().unwrap_or_else(|| json!("unknown")),
        "template": payload.get("template").cloned().unwrap_or_else(|| json!("default")),
        "message_id": format!("msg_{}_{}", ctx.job_id, Utc::now().timestamp()),
    }))
}

async fn data_export(payload: Value, ctx: HandlerContext) -> anyhow::Result<Value> {
    let format = payload
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("csv")
        .to_string();
    let delay = match format.as_str() {
        "pdf" => 8,
        "excel" => 5,
        _ => 3,
    };
    tokio::time::sleep(Duration::from_secs(delay)).await;

    let records_exported = 1000 + fastrand::u64(..5000);
    Ok(json!({
        "export_completed": true,
        "user_id": payload.get("user_id").cloned().unwrap_or(Value::Null),
        "format": format,
        "records_exported": records_exported,
        "file_size_mb": records_exported as f64 * 0.001,
        "download_url": format!("/exports/{}.{format}", ctx.job_id),
    }))
}

async fn data_fetch(payload: Value, _ctx: HandlerContext) -> anyhow::Result<Value> {
    let symbols: Vec<String> = payload
        .get("symbols")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut data = serde_json::Map::new();
    for symbol in &symbols {
        data.insert(
            symbol.clone(),
            json!({
                "price": 100 + fastrand::u32(..500),
                "volume": 1_000_000 + fastrand::u64(..10_000_000),
                "timestamp": Utc::now(),
            }),
        );
    }

    Ok(json!({
        "fetch_completed": true,
        "source": payload.get("source").cloned().unwrap_or_else(|| json!("unknown")),
        "symbols_fetched": symbols.len(),
        "data": data,
    }))
}

async fn data_processing(_payload: Value, ctx: HandlerContext) -> anyhow::Result<Value> {
    tokio::time::sleep(Duration::from_secs(6)).await;
    Ok(json!({
        "processing_completed": true,
        "records_processed": 10_000,
        "processing_time_seconds": 6,
        "output_file": format!("/processed/{}_processed.json", ctx.job_id),
    }))
}

async fn report_generation(payload: Value, ctx: HandlerContext) -> anyhow::Result<Value> {
    let report_type = payload
        .get("report_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let date = payload
        .get("date")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    let delay = match report_type.as_str() {
        "daily_summary" => 4,
        "weekly_analysis" => 8,
        "monthly_report" => 12,
        _ => 5,
    };
    tokio::time::sleep(Duration::from_secs(delay)).await;

    Ok(json!({
        "report_generated": true,
        "report_type": report_type,
        "report_date": date,
        "pages": 15 + fastrand::u32(..50),
        "charts_generated": 5 + fastrand::u32(..10),
        "report_url": format!("/reports/{}_{report_type}_{date}.pdf", ctx.job_id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{HandlerRegistry, JobHandler};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(job_type: &str) -> HandlerContext {
        HandlerContext {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_email_reports_the_recipient() {
        let handler = FnHandler(send_email);
        let out = handler
            .execute(&json!({"to": "ops@example.com"}), &ctx("send_email"))
            .await
            .unwrap();
        assert_eq!(out["email_sent"], true);
        assert_eq!(out["recipient"], "ops@example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn data_fetch_returns_one_entry_per_symbol() {
        let handler = FnHandler(data_fetch);
        let out = handler
            .execute(
                &json!({"source": "nyse", "symbols": ["AAA", "BBB"]}),
                &ctx("data_fetch"),
            )
            .await
            .unwrap();
        assert_eq!(out["symbols_fetched"], 2);
        assert!(out["data"]["AAA"].is_object());
        assert!(out["data"]["BBB"].is_object());
    }

    #[test]
    fn demo_set_registers_the_report_alias() {
        // Registration goes through EngineBuilder; mirror it on a bare
        // registry to check the type list.
        let mut registry = HandlerRegistry::new();
        for job_type in [
            "send_email",
            "data_export",
            "data_fetch",
            "data_processing",
            "report_generation",
            "generate_report",
        ] {
            registry.register(job_type, Arc::new(FnHandler(send_email)));
            assert!(registry.is_registered(job_type));
        }
    }
}
