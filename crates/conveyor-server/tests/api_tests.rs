//! Router-level tests over an engine running on in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use conveyor_core::JobStatus;
use conveyor_server::router;
use conveyor_testing::{SucceedingHandler, TestHarness, TestHarnessBuilder};

async fn harness() -> TestHarness {
    TestHarnessBuilder::new()
        .handler("send_email", Arc::new(SucceedingHandler::instant()))
        .handler(
            "slow_work",
            Arc::new(SucceedingHandler::after(Duration::from_millis(150))),
        )
        .start()
        .await
        .expect("harness should start")
}

async fn request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn submit_returns_the_stored_job_with_position() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (status, body) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({
            "type": "send_email",
            "priority": "high",
            "payload": {"to": "ops@example.com"},
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "send_email");
    assert_eq!(body["priority"], "high");
    assert_eq!(body["current_attempt"], 0);
    assert!(body["job_id"].is_string());
    assert!(body["position_in_queue"].is_u64() || body["position_in_queue"].is_null());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn out_of_range_fields_are_400() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (status, body) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({"type": "send_email", "timeout_seconds": 86401})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());

    let (status, _) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({"type": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_dependency_is_400_and_unknown_job_is_404() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let ghost = uuid::Uuid::new_v4();
    let (status, body) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({"type": "send_email", "depends_on": [ghost]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains(&ghost.to_string()));

    let (status, _) = request(&app, "GET", &format!("/jobs/{ghost}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn listing_pages_and_reports_totals() {
    let h = harness().await;
    let app = router(h.handle.clone());

    for _ in 0..3 {
        let (status, _) = request(
            &app,
            "POST",
            "/jobs",
            Some(json!({"type": "send_email"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = request(&app, "GET", "/jobs?page=1&per_page=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["has_next"], true);
    assert_eq!(body["has_prev"], false);

    let (status, _) = request(&app, "GET", "/jobs?status=sideways", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_surfaces_state_specific_errors() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (_, created) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({"type": "send_email"})),
    )
    .await;
    let id = created["job_id"].as_str().unwrap().to_string();
    let job_id: uuid::Uuid = id.parse().unwrap();
    h.wait_for_status(job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .unwrap();

    let (status, body) = request(&app, "PATCH", &format!("/jobs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Cannot cancel completed job");

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn logs_come_back_newest_first() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (_, created) = request(
        &app,
        "POST",
        "/jobs",
        Some(json!({"type": "send_email"})),
    )
    .await;
    let id = created["job_id"].as_str().unwrap().to_string();
    let job_id: uuid::Uuid = id.parse().unwrap();
    h.wait_for_status(job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .unwrap();

    let (status, body) = request(&app, "GET", &format!("/jobs/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    let logs = body["logs"].as_array().unwrap();
    assert!(logs.len() >= 3);
    // Newest first: completion before creation.
    let messages: Vec<&str> = logs.iter().map(|l| l["message"].as_str().unwrap()).collect();
    let created_pos = messages.iter().position(|m| m.contains("created")).unwrap();
    let completed_pos = messages
        .iter()
        .position(|m| m.contains("completed successfully"))
        .unwrap();
    assert!(completed_pos < created_pos);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn admin_surface_reports_health_and_metrics() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (status, body) = request(&app, "GET", "/admin/system/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["database"], "healthy");

    let (status, body) = request(&app, "GET", "/admin/system/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job_counts"].is_object());
    assert!(body["success_rate_percent"].is_number());

    let (status, body) = request(&app, "GET", "/admin/dlq/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["total_failed"], 0);

    // Bad UUIDs never reach the handler.
    let (status, _) = request(&app, "POST", "/admin/dlq/retry/does-not-parse", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn liveness_routes_answer() {
    let h = harness().await;
    let app = router(h.handle.clone());

    let (status, body) = request(&app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = request(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    h.shutdown().await.unwrap();
}
