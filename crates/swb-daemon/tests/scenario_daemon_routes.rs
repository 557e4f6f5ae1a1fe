//! In-process router tests via tower::ServiceExt::oneshot. These use a lazy
//! pool (no live database): every asserted path either never reaches
//! Postgres or fails before it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use swb_buffer::{BufferConfig, TieredBuffer};
use swb_config::SwitchboardConfig;
use swb_daemon::{routes, state::AppState};
use swb_registry::RegistryCache;
use swb_reliability::{CircuitBreakerConfig, CircuitRegistry, RateLimiter, RetryPolicy};
use swb_router::{HttpButlerSink, Pipeline, TargetDispatcher};
use swb_telemetry::SwitchboardMetrics;
use swb_triage::RuleCache;

fn test_state() -> Arc<AppState> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/swb_unused")
        .expect("lazy pool");

    let cfg = SwitchboardConfig::default();
    let dispatcher = Arc::new(TargetDispatcher::new(
        Arc::new(HttpButlerSink::new()),
        Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
        Arc::new(RateLimiter::new(|_| (100.0, 10.0))),
        RetryPolicy::new(1, 1, 5),
        cfg.timeouts.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        pool,
        cfg,
        Arc::new(RuleCache::new()),
        Arc::new(RegistryCache::new()),
        None,
        Arc::clone(&dispatcher),
        Arc::new(TieredBuffer::new(BufferConfig::default())),
        Arc::new(SwitchboardMetrics::new("switchboard_test")),
    ));

    Arc::new(AppState::new(pipeline, dispatcher))
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = routes::build_router(test_state());

    let resp = app
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "swb-daemon");
}

#[tokio::test]
async fn malformed_envelope_is_rejected_with_validation_error() {
    let app = routes::build_router(test_state());

    // Missing event.external_event_id entirely.
    let envelope = json!({
        "schema_version": "ingest.v1",
        "source": { "channel": "telegram", "provider": "telegram", "endpoint_identity": "E1" },
        "event": { "observed_at": "2026-03-01T00:00:00Z" },
        "sender": { "identity": "U1" },
        "payload": { "raw": {} },
        "control": { "policy_tier": "default" }
    });

    let resp = app
        .oneshot(
            Request::post("/v1/ingest")
                .header("content-type", "application/json")
                .body(Body::from(envelope.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error_category"], "validation_error");
    assert!(body["error"].as_str().unwrap().contains("external_event_id"));
}

#[tokio::test]
async fn wrong_schema_version_is_rejected() {
    let app = routes::build_router(test_state());

    let envelope = json!({
        "schema_version": "ingest.v2",
        "source": { "channel": "telegram", "provider": "telegram", "endpoint_identity": "E1" },
        "event": { "external_event_id": "evt-1", "observed_at": "2026-03-01T00:00:00Z" },
        "sender": { "identity": "U1" },
        "payload": { "raw": {} },
        "control": { "policy_tier": "default" }
    });

    let resp = app
        .oneshot(
            Request::post("/v1/ingest")
                .header("content-type", "application/json")
                .body(Body::from(envelope.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error_category"], "validation_error");
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let app = routes::build_router(test_state());

    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("switchboard_test_"));
}

#[tokio::test]
async fn notify_with_wrong_schema_version_is_rejected() {
    let app = routes::build_router(test_state());

    let notify = json!({
        "schema_version": "notify.v2",
        "source_butler": "health",
        "channel": "telegram",
        "recipient": "4242",
        "message": "hello",
    });

    let resp = app
        .oneshot(
            Request::post("/v1/notify")
                .header("content-type", "application/json")
                .body(Body::from(notify.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn timeouts_default_by_channel() {
    // Not an HTTP test, but pins the per-channel defaults the daemon wires
    // into every dispatcher.
    let cfg = SwitchboardConfig::default();
    assert_eq!(cfg.timeouts.for_channel("telegram"), Duration::from_secs(15));
    assert_eq!(cfg.timeouts.for_channel("email"), Duration::from_secs(45));
    assert_eq!(cfg.timeouts.for_channel("sms"), Duration::from_secs(20));
    assert_eq!(cfg.timeouts.for_channel("chat"), Duration::from_secs(25));
    assert_eq!(cfg.timeouts.for_channel("carrier-pigeon"), Duration::from_secs(30));
}
