//! Request/response bodies for the daemon HTTP surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Error body for rejected ingress (validation or overload).
#[derive(Debug, Clone, Serialize)]
pub struct IngestErrorResponse {
    pub error: String,
    pub error_category: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorCancelBody {
    pub request_id: Uuid,
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorRerouteBody {
    pub request_id: Uuid,
    pub target: String,
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorReplayBody {
    pub dlq_id: Uuid,
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorForceCompleteBody {
    pub request_id: Uuid,
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorActionResponse {
    pub outcome: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifyAck {
    pub success: bool,
    pub duration_ms: i64,
    pub logged_id: Uuid,
}
