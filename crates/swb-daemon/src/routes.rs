//! Axum router and all HTTP handlers for swb-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

use swb_connectors::{chat, telegram};

use swb_router::IngestVerdict;
use swb_schemas::{ErrorCategory, IngressEnvelope, NotifyRequestV1, SCHEMA_NOTIFY_V1};

use crate::api_types::{
    HealthResponse, IngestErrorResponse, NotifyAck, OperatorActionResponse, OperatorCancelBody,
    OperatorForceCompleteBody, OperatorReplayBody, OperatorRerouteBody,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ingest", post(ingest))
        .route("/v1/notify", post(notify))
        .route("/v1/connectors/telegram/webhook", post(telegram_webhook))
        .route("/v1/connectors/chat/webhook", post(chat_webhook))
        .route("/metrics", get(metrics))
        .route("/v1/operator/cancel", post(operator_cancel))
        .route("/v1/operator/reroute", post(operator_reroute))
        .route("/v1/operator/replay", post(operator_replay))
        .route("/v1/operator/force-complete", post(operator_force_complete))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: st.uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/ingest
// ---------------------------------------------------------------------------

/// Canonical ingest entry point. Non-2xx only for malformed envelopes (400)
/// and bulk-tier overload (429); everything else is `accepted`.
pub(crate) async fn ingest(State(st): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let envelope: IngressEnvelope = match serde_json::from_value(body) {
        Ok(env) => env,
        Err(e) => return validation_error(e.to_string()),
    };
    submit_envelope(&st, envelope).await
}

fn validation_error(detail: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(IngestErrorResponse {
            error: detail,
            error_category: ErrorCategory::ValidationError.as_str().to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/notify
// ---------------------------------------------------------------------------

/// Outbound delivery log from a butler. The actual channel send is the
/// messenger butler's job; the switchboard records the outbound leg into
/// the conversation history and the routing log.
pub(crate) async fn notify(
    State(st): State<Arc<AppState>>,
    Json(body): Json<NotifyRequestV1>,
) -> Response {
    if body.schema_version != SCHEMA_NOTIFY_V1 {
        return validation_error(format!(
            "expected schema_version {SCHEMA_NOTIFY_V1:?}, got {:?}",
            body.schema_version
        ));
    }

    let started = Instant::now();
    let pool = st.pipeline.pool();

    let logged = match swb_db::log_outbound_notification(pool, &body, true).await {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestErrorResponse {
                    error: format!("notify log failed: {e:#}"),
                    error_category: ErrorCategory::Unknown.as_str().to_string(),
                }),
            )
                .into_response()
        }
    };

    let _ = swb_db::insert_routing_log(
        pool,
        &swb_db::NewRoutingLog {
            request_id: Some(logged),
            source_butler: body.source_butler.clone(),
            target_butler: "switchboard".to_string(),
            tool_name: "notify.v1".to_string(),
            success: true,
            duration_ms: Some(started.elapsed().as_millis() as i32),
            error: None,
            source_endpoint_identity: None,
            source_sender_identity: Some(body.recipient.clone()),
            source_thread_identity: None,
        },
    )
    .await;

    info!(source_butler = %body.source_butler, channel = %body.channel, "outbound notification logged");
    (
        StatusCode::OK,
        Json(NotifyAck {
            success: true,
            duration_ms: started.elapsed().as_millis() as i64,
            logged_id: logged,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Connector webhooks (push-based sources)
// ---------------------------------------------------------------------------

async fn submit_envelope(st: &AppState, envelope: swb_schemas::IngressEnvelope) -> Response {
    let envelope = match envelope.validate_and_normalize() {
        Ok(env) => env,
        Err(e) => return validation_error(e.to_string()),
    };

    match st.pipeline.ingest(envelope).await {
        Ok(IngestVerdict::Accepted(accepted)) => (StatusCode::OK, Json(accepted)).into_response(),
        Ok(IngestVerdict::Overload) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(IngestErrorResponse {
                error: "buffer at hard limit; bulk ingress rejected".to_string(),
                error_category: ErrorCategory::Overload.as_str().to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(IngestErrorResponse {
                error: format!("ingest failed: {e:#}"),
                error_category: ErrorCategory::Unknown.as_str().to_string(),
            }),
        )
            .into_response(),
    }
}

/// Telegram pushes updates here; `?bot=<id>` names the endpoint identity.
pub(crate) async fn telegram_webhook(
    State(st): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let update: telegram::TelegramUpdate = match serde_json::from_value(body.clone()) {
        Ok(u) => u,
        Err(e) => return validation_error(format!("unrecognized telegram update: {e}")),
    };

    let bot = params.get("bot").map(String::as_str).unwrap_or("telegram-bot");
    let envelope = telegram::envelope_from_update(bot, &update, body);
    submit_envelope(&st, envelope).await
}

/// Generic chat providers push events here; `?provider=<name>` labels them.
pub(crate) async fn chat_webhook(
    State(st): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let event: chat::ChatEvent = match serde_json::from_value(body.clone()) {
        Ok(e) => e,
        Err(e) => return validation_error(format!("unrecognized chat event: {e}")),
    };

    let provider = params.get("provider").map(String::as_str).unwrap_or("chat");
    let envelope = chat::envelope_from_chat_event(provider, &event, body);
    submit_envelope(&st, envelope).await
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

pub(crate) async fn metrics(State(st): State<Arc<AppState>>) -> Response {
    match st.pipeline.metrics().render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode failed: {e:#}"),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Operator surface
// ---------------------------------------------------------------------------

fn operator_response(result: swb_router::OperatorActionResult) -> Response {
    let status = if result.succeeded() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (
        status,
        Json(OperatorActionResponse {
            outcome: match result.outcome {
                swb_db::AuditOutcome::Success => "success",
                swb_db::AuditOutcome::Failed => "failed",
                swb_db::AuditOutcome::Rejected => "rejected",
                swb_db::AuditOutcome::Partial => "partial",
            }
            .to_string(),
            detail: result.detail,
            new_request_id: result.new_request_id,
        }),
    )
        .into_response()
}

fn operator_error(e: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(IngestErrorResponse {
            error: format!("{e:#}"),
            error_category: ErrorCategory::Unknown.as_str().to_string(),
        }),
    )
        .into_response()
}

pub(crate) async fn operator_cancel(
    State(st): State<Arc<AppState>>,
    Json(body): Json<OperatorCancelBody>,
) -> Response {
    match swb_router::cancel_request(&st.pipeline, body.request_id, &body.operator, &body.reason)
        .await
    {
        Ok(result) => operator_response(result),
        Err(e) => operator_error(e),
    }
}

pub(crate) async fn operator_reroute(
    State(st): State<Arc<AppState>>,
    Json(body): Json<OperatorRerouteBody>,
) -> Response {
    match swb_router::reroute(
        &st.pipeline,
        Arc::clone(&st.dispatcher),
        body.request_id,
        &body.target,
        &body.operator,
        &body.reason,
    )
    .await
    {
        Ok(result) => operator_response(result),
        Err(e) => operator_error(e),
    }
}

pub(crate) async fn operator_replay(
    State(st): State<Arc<AppState>>,
    Json(body): Json<OperatorReplayBody>,
) -> Response {
    match swb_router::replay(&st.pipeline, body.dlq_id, &body.operator, &body.reason).await {
        Ok(result) => operator_response(result),
        Err(e) => operator_error(e),
    }
}

pub(crate) async fn operator_force_complete(
    State(st): State<Arc<AppState>>,
    Json(body): Json<OperatorForceCompleteBody>,
) -> Response {
    match swb_router::force_complete(&st.pipeline, body.request_id, &body.operator, &body.reason)
        .await
    {
        Ok(result) => operator_response(result),
        Err(e) => operator_error(e),
    }
}
