//! The dispatch boundary: all butler traffic passes through [`ButlerSink`].
//!
//! The router stays agnostic to how a butler is reached; production wires
//! [`HttpButlerSink`], tests inject scripted sinks. Keeping this boundary
//! thin keeps the fanout logic deterministic and broker-free.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use swb_schemas::{DispatchResponse, RouteRequestV1};

/// Transport-level dispatch failure, before taxonomy mapping.
#[derive(Debug, Clone)]
pub enum SinkError {
    Timeout,
    Connect(String),
    /// Non-2xx status from the target.
    Status {
        code: u16,
        retry_after: Option<Duration>,
    },
    /// 2xx but the body was not a valid `DispatchResponse`.
    BadResponse(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Timeout => write!(f, "dispatch timed out"),
            SinkError::Connect(e) => write!(f, "connection failed: {e}"),
            SinkError::Status { code, .. } => write!(f, "target returned status {code}"),
            SinkError::BadResponse(e) => write!(f, "unparseable target response: {e}"),
        }
    }
}

impl std::error::Error for SinkError {}

#[async_trait]
pub trait ButlerSink: Send + Sync {
    async fn dispatch(
        &self,
        endpoint_url: &str,
        request: &RouteRequestV1,
    ) -> Result<DispatchResponse, SinkError>;
}

/// HTTP sink posting `route.v1` as JSON.
pub struct HttpButlerSink {
    http: reqwest::Client,
}

impl HttpButlerSink {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpButlerSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ButlerSink for HttpButlerSink {
    async fn dispatch(
        &self,
        endpoint_url: &str,
        request: &RouteRequestV1,
    ) -> Result<DispatchResponse, SinkError> {
        let started = Instant::now();

        let resp = self
            .http
            .post(endpoint_url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkError::Timeout
                } else {
                    SinkError::Connect(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(swb_reliability::parse_retry_after);
            return Err(SinkError::Status {
                code: status.as_u16(),
                retry_after,
            });
        }

        let mut body: DispatchResponse = resp
            .json()
            .await
            .map_err(|e| SinkError::BadResponse(e.to_string()))?;

        // Targets that omit timing get wall-clock from our side.
        if body.duration_ms == 0 {
            body.duration_ms = started.elapsed().as_millis() as i64;
        }
        Ok(body)
    }
}
