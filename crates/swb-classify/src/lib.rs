//! Classifier client: one structured-output call per request, with a hard
//! fallback path.
//!
//! The classifier is an opaque sink behind the [`Classifier`] trait. The
//! contract is strict: a single timeout-bounded attempt, no synchronous
//! retry. Any failure (timeout, transport, unparseable output) falls back
//! to the configured default target with `parse_source=fallback`, preserving
//! the end-to-end latency budget.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use swb_schemas::{ParseSource, RouteDecision, RouteTarget};

/// What the classifier sees: the envelope summary plus operator routing
/// instructions in stable priority order.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyInput {
    pub request_id: Uuid,
    pub envelope: Value,
    pub routing_instructions: Vec<String>,
}

/// Why a classification attempt produced no usable decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    Timeout,
    Transport(String),
    /// The sink answered but the body was not a valid `RouteDecision`.
    ParseFailure(String),
}

impl std::fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifyError::Timeout => write!(f, "classifier timed out"),
            ClassifyError::Transport(e) => write!(f, "classifier transport error: {e}"),
            ClassifyError::ParseFailure(e) => write!(f, "classifier parse_failure: {e}"),
        }
    }
}

impl std::error::Error for ClassifyError {}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: &ClassifyInput) -> Result<RouteDecision, ClassifyError>;
}

/// HTTP-backed classifier sink.
pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint_url: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(endpoint_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint_url: endpoint_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, input: &ClassifyInput) -> Result<RouteDecision, ClassifyError> {
        let resp = self
            .http
            .post(&self.endpoint_url)
            .timeout(self.timeout)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifyError::Timeout
                } else {
                    ClassifyError::Transport(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(ClassifyError::Transport(format!(
                "classifier returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ClassifyError::ParseFailure(e.to_string()))?;

        let mut decision: RouteDecision = serde_json::from_value(body)
            .map_err(|e| ClassifyError::ParseFailure(e.to_string()))?;

        if decision.targets.is_empty() {
            return Err(ClassifyError::ParseFailure("decision has no targets".to_string()));
        }

        // Provenance is ours to assert, whatever the sink claimed.
        decision.parse_source = ParseSource::Classifier;
        Ok(decision)
    }
}

/// The decision used when classification fails or no classifier is wired.
pub fn fallback_decision(default_target: &str) -> RouteDecision {
    RouteDecision::single(RouteTarget::named(default_target), ParseSource::Fallback)
}

/// One classification attempt, then fallback. Returns the decision plus the
/// error that triggered the fallback (for telemetry), if any.
pub async fn classify_or_fallback(
    classifier: Option<&dyn Classifier>,
    input: &ClassifyInput,
    default_target: &str,
) -> (RouteDecision, Option<ClassifyError>) {
    let Some(classifier) = classifier else {
        return (fallback_decision(default_target), None);
    };

    match classifier.classify(input).await {
        Ok(decision) => (decision, None),
        Err(e) => {
            warn!(request_id = %input.request_id, error = %e, "classification failed; using fallback target");
            (fallback_decision(default_target), Some(e))
        }
    }
}
