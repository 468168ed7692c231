//! `/jobs/stream`: live job updates over WebSocket.
//!
//! Each connection gets its own broadcast subscription. Delivery is
//! best-effort: a subscriber that falls behind the buffer is disconnected
//! instead of slowing the dispatcher down.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use conveyor_core::{EngineHandle, JobEvent};

pub async fn job_stream(
    State(handle): State<EngineHandle>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_connection(socket, handle))
}

async fn run_connection(mut socket: WebSocket, handle: EngineHandle) {
    let mut events = handle.subscribe();
    info!("websocket subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = envelope(&event).to_string();
                    if socket.send(Message::Text(frame)).await.is_err() {
                        debug!("websocket subscriber went away");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Slow consumer: drop it rather than buffer without bound.
                    info!(skipped, "websocket subscriber lagged, disconnecting");
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Inbound frames only keep the connection alive.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

/// Wire shape: `{type, event, job_id?, data, timestamp}`.
fn envelope(event: &JobEvent) -> Value {
    let (kind, timestamp, data) = match event {
        JobEvent::Created {
            job_id,
            job_type,
            priority,
            timestamp,
        } => (
            "job_update",
            timestamp,
            json!({"job_id": job_id, "type": job_type, "priority": priority}),
        ),
        JobEvent::Started {
            job_id,
            job_type,
            priority,
            attempt,
            timestamp,
        } => (
            "job_update",
            timestamp,
            json!({"job_id": job_id, "type": job_type, "priority": priority, "attempt": attempt}),
        ),
        JobEvent::Completed {
            job_id,
            result,
            timestamp,
        } => (
            "job_update",
            timestamp,
            json!({"job_id": job_id, "result": result}),
        ),
        JobEvent::RetryScheduled {
            job_id,
            attempt,
            max_attempts,
            retry_at,
            error,
            timestamp,
        } => (
            "job_update",
            timestamp,
            json!({
                "job_id": job_id,
                "attempt": attempt,
                "max_attempts": max_attempts,
                "retry_at": retry_at,
                "error": error,
            }),
        ),
        JobEvent::Failed {
            job_id,
            error,
            final_attempt,
            timestamp,
        } => (
            "job_update",
            timestamp,
            json!({"job_id": job_id, "error": error, "final_attempt": final_attempt}),
        ),
        JobEvent::Cancelled { job_id, timestamp } => {
            ("job_update", timestamp, json!({"job_id": job_id}))
        }
        JobEvent::System {
            event: name,
            data,
            timestamp,
        } => {
            return json!({
                "type": "system_event",
                "event": name,
                "data": data,
                "timestamp": timestamp,
            });
        }
    };

    json!({
        "type": kind,
        "event": event.name(),
        "job_id": event.job_id(),
        "data": data,
        "timestamp": timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn job_events_wrap_in_the_job_update_envelope() {
        let job_id = Uuid::new_v4();
        let frame = envelope(&JobEvent::Failed {
            job_id,
            error: "boom".to_string(),
            final_attempt: true,
            timestamp: Utc::now(),
        });
        assert_eq!(frame["type"], "job_update");
        assert_eq!(frame["event"], "job_failed");
        assert_eq!(frame["job_id"], job_id.to_string());
        assert_eq!(frame["data"]["final_attempt"], true);
    }

    #[test]
    fn system_events_use_their_own_envelope() {
        let frame = envelope(&JobEvent::System {
            event: "engine_started".to_string(),
            data: json!({"max_concurrent_jobs": 10}),
            timestamp: Utc::now(),
        });
        assert_eq!(frame["type"], "system_event");
        assert_eq!(frame["event"], "engine_started");
        assert!(frame.get("job_id").is_none());
    }
}
