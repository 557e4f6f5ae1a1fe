//! Shared harness for cross-crate scenario tests: envelope builders, a
//! scripted butler sink, and a fully wired pipeline over a test database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;

use swb_buffer::{BufferConfig, TieredBuffer};
use swb_config::SwitchboardConfig;
use swb_registry::RegistryCache;
use swb_reliability::{CircuitBreakerConfig, CircuitRegistry, RateLimiter, RetryPolicy};
use swb_router::{ButlerSink, Pipeline, SinkError, TargetDispatcher};
use swb_schemas::{
    DispatchResponse, EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender,
    EnvelopeSource, IngressEnvelope, PolicyTier, RouteRequestV1, SCHEMA_INGEST_V1,
};
use swb_telemetry::SwitchboardMetrics;
use swb_triage::RuleCache;

// ---------------------------------------------------------------------------
// Envelope builder
// ---------------------------------------------------------------------------

/// Fluent builder for test envelopes. Defaults form a valid telegram text
/// message; override what the scenario cares about.
pub struct EnvelopeBuilder {
    channel: String,
    endpoint: String,
    sender: String,
    event_id: String,
    thread: Option<String>,
    text: String,
    tier: PolicyTier,
}

impl EnvelopeBuilder {
    pub fn new(event_id: &str) -> Self {
        Self {
            channel: "telegram".to_string(),
            endpoint: "E1".to_string(),
            sender: "U1".to_string(),
            event_id: event_id.to_string(),
            thread: None,
            text: "hi".to_string(),
            tier: PolicyTier::Default,
        }
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = channel.to_string();
        self
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = sender.to_string();
        self
    }

    pub fn thread(mut self, thread: &str) -> Self {
        self.thread = Some(thread.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn tier(mut self, tier: PolicyTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn build(self) -> IngressEnvelope {
        IngressEnvelope {
            schema_version: SCHEMA_INGEST_V1.to_string(),
            source: EnvelopeSource {
                channel: self.channel.clone(),
                provider: self.channel,
                endpoint_identity: self.endpoint,
            },
            event: EnvelopeEvent {
                external_event_id: self.event_id,
                external_thread_id: self.thread,
                observed_at: Utc::now(),
            },
            sender: EnvelopeSender {
                identity: self.sender,
                display: None,
                roles: None,
            },
            payload: EnvelopePayload {
                raw: json!({ "text": self.text }),
                normalized_text: Some(self.text),
                attachments: vec![],
            },
            control: EnvelopeControl { policy_tier: self.tier },
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// Sink with per-target scripted failures and a shared call log.
pub struct RecordingSink {
    /// target -> HTTP status codes to fail with, consumed per call.
    scripts: Mutex<HashMap<String, Vec<u16>>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue `count` failures with `status` for `target`; later calls succeed.
    pub fn fail_times(&self, target: &str, status: u16, count: usize) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .extend(std::iter::repeat(status).take(count));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ButlerSink for RecordingSink {
    async fn dispatch(
        &self,
        _endpoint_url: &str,
        request: &RouteRequestV1,
    ) -> Result<DispatchResponse, SinkError> {
        self.calls.lock().unwrap().push(request.target.clone());

        let next_failure = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&request.target).and_then(|v| {
                if v.is_empty() {
                    None
                } else {
                    Some(v.remove(0))
                }
            })
        };

        match next_failure {
            Some(code) => Err(SinkError::Status { code, retry_after: None }),
            None => Ok(DispatchResponse {
                success: true,
                duration_ms: 3,
                error: None,
                error_category: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline harness
// ---------------------------------------------------------------------------

/// A pipeline wired for tests: injected sink, fast retries, no classifier.
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub sink: Arc<RecordingSink>,
    pub registry: Arc<RegistryCache>,
    pub rules: Arc<RuleCache>,
}

/// Build a harness over an existing (migrated) pool.
pub async fn harness(pool: PgPool) -> Harness {
    let mut cfg = SwitchboardConfig::default();
    cfg.dispatch.retry_max_attempts = 2;
    cfg.dispatch.retry_base_ms = 1;
    cfg.dispatch.retry_cap_ms = 5;
    cfg.dispatch.deadline_default_ms = 10_000;

    let sink = Arc::new(RecordingSink::new());
    let rules = Arc::new(RuleCache::new());
    let registry = Arc::new(RegistryCache::new());

    let dispatcher = Arc::new(TargetDispatcher::new(
        sink.clone() as Arc<dyn ButlerSink>,
        Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 2,
        })),
        Arc::new(RateLimiter::new(|_| (10_000.0, 10_000.0))),
        RetryPolicy::new(cfg.dispatch.retry_max_attempts, 1, 5),
        cfg.timeouts.clone(),
    ));

    let buffer = Arc::new(TieredBuffer::new(BufferConfig {
        max_depth: cfg.buffer.max_depth,
        hard_limit: cfg.buffer.hard_limit,
        starvation_guard: cfg.buffer.starvation_guard,
    }));

    let pipeline = Arc::new(Pipeline::new(
        pool,
        cfg,
        Arc::clone(&rules),
        Arc::clone(&registry),
        None,
        dispatcher,
        buffer,
        Arc::new(SwitchboardMetrics::new("switchboard_test")),
    ));

    Harness {
        pipeline,
        sink,
        registry,
        rules,
    }
}

/// Register a butler in both the DB and the cached snapshot.
pub async fn register_test_butler(h: &Harness, name: &str) -> anyhow::Result<()> {
    swb_db::upsert_butler(
        h.pipeline.pool(),
        &swb_db::NewButler {
            name: name.to_string(),
            endpoint_url: format!("http://{name}.test/route"),
            transport: "http".to_string(),
            description: None,
            modules: vec![],
            capabilities: json!({}),
        },
    )
    .await?;
    h.registry.refresh(h.pipeline.pool()).await?;
    Ok(())
}
