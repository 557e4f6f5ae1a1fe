//! End-to-end request pipeline: ingest → triage → classify → fanout →
//! lifecycle, with the durable buffer between accept and processing.
//!
//! The pipeline owns no request state beyond the cancel map; the inbox row
//! is the single source of truth and every step advances it with a
//! conditional transition, so a crashed or duplicated worker can never
//! regress a request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use swb_buffer::{EnqueueOutcome, TieredBuffer};
use swb_classify::{Classifier, ClassifyError, ClassifyInput};
use swb_config::SwitchboardConfig;
use swb_db::NewRoutingLog;
use swb_registry::RegistryCache;
use swb_schemas::{
    DispatchOutcome, ErrorCategory, IngestAccepted, IngressEnvelope, LifecycleState, ParseSource,
    PolicyTier, RouteDecision,
};
use swb_telemetry::{
    DispatchLabels, ErrorClassLabels, FanoutLabels, LifecycleLabels, ParseSourceLabels,
    SourceLabels, SwitchboardMetrics, TargetLabels, TierLabels,
};
use swb_triage::{evaluate_triage, RuleCache, TriageVerdict};

use crate::cancel::ActiveRequests;
use crate::dispatcher::TargetDispatcher;
use crate::fanout::{execute_fanout, Disposition, FanoutPlan};
use crate::thread_order::ThreadSerializer;

/// Unit of work flowing through the durable buffer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub request_id: Uuid,
    pub envelope: IngressEnvelope,
}

/// Ingest verdict returned to connectors.
#[derive(Debug, Clone)]
pub enum IngestVerdict {
    Accepted(IngestAccepted),
    /// Bulk-tier ingress refused at the hard limit. No row was written.
    Overload,
}

pub struct Pipeline {
    pool: PgPool,
    cfg: SwitchboardConfig,
    rules: Arc<RuleCache>,
    registry: Arc<RegistryCache>,
    classifier: Option<Arc<dyn Classifier>>,
    dispatcher: Arc<TargetDispatcher>,
    buffer: Arc<TieredBuffer<WorkItem>>,
    serializer: ThreadSerializer,
    active: Arc<ActiveRequests>,
    metrics: Arc<SwitchboardMetrics>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        cfg: SwitchboardConfig,
        rules: Arc<RuleCache>,
        registry: Arc<RegistryCache>,
        classifier: Option<Arc<dyn Classifier>>,
        dispatcher: Arc<TargetDispatcher>,
        buffer: Arc<TieredBuffer<WorkItem>>,
        metrics: Arc<SwitchboardMetrics>,
    ) -> Self {
        Self {
            pool,
            cfg,
            rules,
            registry,
            classifier,
            dispatcher,
            buffer,
            serializer: ThreadSerializer::new(),
            active: Arc::new(ActiveRequests::new()),
            metrics,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn buffer(&self) -> &Arc<TieredBuffer<WorkItem>> {
        &self.buffer
    }

    pub fn active(&self) -> &Arc<ActiveRequests> {
        &self.active
    }

    pub fn metrics(&self) -> &Arc<SwitchboardMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.cfg
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Idempotent accept. The envelope must already be validated and
    /// normalized. Duplicates return the prior request id and enqueue
    /// nothing; the original owner keeps processing.
    pub async fn ingest(&self, envelope: IngressEnvelope) -> Result<IngestVerdict> {
        let started = Instant::now();
        let tier = envelope.control.policy_tier;

        if tier == PolicyTier::Bulk && self.buffer.total_depth() >= self.cfg.buffer.hard_limit {
            self.metrics
                .overload
                .get_or_create(&TierLabels { policy_tier: tier.as_str().to_string() })
                .inc();
            return Ok(IngestVerdict::Overload);
        }

        let accepted =
            swb_db::ingest_envelope(&self.pool, &envelope, self.cfg.dedupe.window_days).await?;

        let source = SourceLabels { source: envelope.source.channel.clone() };
        self.metrics.received.get_or_create(&source).inc();

        if accepted.duplicate {
            self.metrics.duplicates.get_or_create(&source).inc();
        } else {
            let outcome = self.buffer.enqueue(
                tier,
                WorkItem {
                    request_id: accepted.request_id,
                    envelope,
                },
            );
            if outcome == EnqueueOutcome::Deferred {
                info!(request_id = %accepted.request_id, "buffer past max depth; scheduling deferred");
            }
            self.observe_depth();
        }

        self.metrics
            .ingress_accept_seconds
            .observe(started.elapsed().as_secs_f64());

        Ok(IngestVerdict::Accepted(accepted))
    }

    fn observe_depth(&self) {
        for tier in PolicyTier::ALL {
            self.metrics
                .queue_depth
                .get_or_create(&TierLabels { policy_tier: tier.as_str().to_string() })
                .set(self.buffer.depth(tier) as i64);
        }
    }

    // -----------------------------------------------------------------------
    // Worker loop
    // -----------------------------------------------------------------------

    /// Consume the buffer forever. Per-request failures are logged and
    /// recorded; they never take the worker down.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let (_tier, item) = self.buffer.dequeue().await;
            self.observe_depth();
            let request_id = item.request_id;
            if let Err(e) = self.process(item).await {
                error!(request_id = %request_id, error = ?e, "request processing failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-request processing
    // -----------------------------------------------------------------------

    pub async fn process(&self, item: WorkItem) -> Result<()> {
        let WorkItem { request_id, envelope } = item;
        let started = Instant::now();

        let cancel = self.active.register(request_id);
        self.metrics.in_flight.set(self.active.in_flight() as i64);

        let result = self.process_inner(request_id, &envelope, started, &cancel).await;

        self.active.finish(request_id);
        self.metrics.in_flight.set(self.active.in_flight() as i64);
        self.metrics
            .end_to_end_seconds
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn process_inner(
        &self,
        request_id: Uuid,
        envelope: &IngressEnvelope,
        started: Instant,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<()> {
        // --- Triage -------------------------------------------------------
        let decision_started = Instant::now();
        let rules = self.rules.snapshot().await;
        let affinity = self.lookup_affinity(envelope).await?;
        let triage = evaluate_triage(envelope, &rules, affinity.as_deref());

        let triage_json = serde_json::to_value(&triage).context("serialize triage outcome")?;
        swb_db::record_triage_outcome(&self.pool, request_id, &triage_json).await?;

        if !self
            .advance(request_id, LifecycleState::Accepted, LifecycleState::Triaged)
            .await?
        {
            // Another worker owns this request.
            return Ok(());
        }

        let (route, parse_source, classify_error) = match &triage.verdict {
            TriageVerdict::Drop => {
                self.advance(request_id, LifecycleState::Triaged, LifecycleState::Completed)
                    .await?;
                info!(request_id = %request_id, "request dropped by triage");
                return Ok(());
            }
            TriageVerdict::Route { decision } => {
                self.metrics
                    .triage_short_circuit
                    .get_or_create(&SourceLabels {
                        source: envelope.source.channel.clone(),
                    })
                    .inc();
                self.advance(request_id, LifecycleState::Triaged, LifecycleState::Dispatching)
                    .await?;
                (decision.clone(), ParseSource::Triage, None)
            }
            TriageVerdict::Escalate => {
                self.advance(request_id, LifecycleState::Triaged, LifecycleState::Classifying)
                    .await?;
                let (decision, err) = self.classify(request_id, envelope).await?;
                let source = decision.parse_source;
                self.advance(
                    request_id,
                    LifecycleState::Classifying,
                    LifecycleState::Dispatching,
                )
                .await?;
                (decision, source, err)
            }
        };

        if let Some(e) = &classify_error {
            self.metrics.classifier_fallback.inc();
            if matches!(e, ClassifyError::ParseFailure(_)) {
                self.metrics.classifier_parse_failure.inc();
            }
        }

        self.metrics
            .routing_decision_seconds
            .get_or_create(&ParseSourceLabels {
                parse_source: parse_source.as_str().to_string(),
            })
            .observe(decision_started.elapsed().as_secs_f64());

        // --- Dispatch (serialized per conversation thread) ----------------
        let _thread_guard = self.serializer.acquire(envelope.thread_key()).await;

        let fanout_started = Instant::now();
        let deadline =
            started + Duration::from_millis(self.cfg.dispatch.deadline_default_ms);

        let endpoints = self.resolve_endpoints(&route).await;
        let plan = FanoutPlan {
            request_id,
            decision: route.clone(),
            channel: envelope.source.channel.clone(),
            tier: envelope.control.policy_tier,
            context: json!({
                "text": envelope.text(),
                "sender": envelope.sender.identity,
                "channel": envelope.source.channel,
                "thread": envelope.event.external_thread_id,
                "parse_source": parse_source.as_str(),
            }),
            deadline,
        };

        let result = execute_fanout(Arc::clone(&self.dispatcher), &endpoints, &plan, cancel).await;

        self.metrics
            .fanout_completion_seconds
            .get_or_create(&FanoutLabels {
                fanout_mode: match route.fanout_mode {
                    swb_schemas::FanoutMode::Sequential => "sequential".to_string(),
                    swb_schemas::FanoutMode::Parallel => "parallel".to_string(),
                },
            })
            .observe(fanout_started.elapsed().as_secs_f64());

        self.record_outcomes(request_id, envelope, &result.outcomes).await?;
        self.metrics.open_circuits.set(self.dispatcher.circuits().open_count() as i64);

        // --- Terminal lifecycle -------------------------------------------
        match result.disposition {
            Disposition::Success | Disposition::Partial => {
                self.advance(request_id, LifecycleState::Dispatching, LifecycleState::Completed)
                    .await?;
                self.pin_affinity(envelope, &result.outcomes).await?;
            }
            Disposition::Failure => {
                self.advance(request_id, LifecycleState::Dispatching, LifecycleState::Failed)
                    .await?;

                if cancel.is_cancelled() {
                    // Operator cancel: the request ends failed; completed
                    // subroutes above remain recorded.
                    warn!(request_id = %request_id, "request cancelled during dispatch");
                    return Ok(());
                }

                self.dead_letter(request_id, envelope, &result.outcomes).await?;
            }
        }

        Ok(())
    }

    async fn lookup_affinity(&self, envelope: &IngressEnvelope) -> Result<Option<String>> {
        let Some((channel, thread)) = envelope.thread_key() else {
            return Ok(None);
        };
        swb_db::lookup_thread_affinity(
            &self.pool,
            channel,
            thread,
            self.cfg.triage.affinity_ttl_seconds,
        )
        .await
    }

    async fn classify(
        &self,
        request_id: Uuid,
        envelope: &IngressEnvelope,
    ) -> Result<(RouteDecision, Option<ClassifyError>)> {
        let instructions = swb_db::load_active_instructions(&self.pool)
            .await
            .unwrap_or_else(|e| {
                warn!(error = ?e, "failed to load routing instructions; classifying without them");
                Vec::new()
            });

        let input = ClassifyInput {
            request_id,
            envelope: serde_json::to_value(envelope).context("serialize envelope")?,
            routing_instructions: instructions,
        };

        let (decision, err) = swb_classify::classify_or_fallback(
            self.classifier.as_deref(),
            &input,
            &self.cfg.classifier.default_target,
        )
        .await;

        let classification = serde_json::to_value(&decision).context("serialize classification")?;
        swb_db::record_classification(&self.pool, request_id, &classification).await?;

        Ok((decision, err))
    }

    /// Endpoint resolution for operator-driven dispatches (`ops`).
    pub async fn resolve_endpoints_for(&self, decision: &RouteDecision) -> HashMap<String, String> {
        self.resolve_endpoints(decision).await
    }

    /// Outcome recording for operator-driven dispatches (`ops`).
    pub async fn record_outcomes_for(
        &self,
        request_id: Uuid,
        envelope: &IngressEnvelope,
        outcomes: &[DispatchOutcome],
    ) -> Result<()> {
        self.record_outcomes(request_id, envelope, outcomes).await
    }

    /// Hand a replayed request to the worker loop.
    pub fn enqueue_replay(&self, item: WorkItem) {
        let tier = item.envelope.control.policy_tier;
        let _ = self.buffer.enqueue(tier, item);
        self.observe_depth();
    }

    async fn resolve_endpoints(&self, decision: &RouteDecision) -> HashMap<String, String> {
        let snapshot = self.registry.snapshot().await;
        let mut endpoints = HashMap::new();
        for target in &decision.targets {
            if let Some(row) = snapshot.get(&target.butler) {
                endpoints.insert(target.butler.clone(), row.endpoint_url.clone());
            } else if let Some(url) = self.cfg.registry.endpoint_overrides.get(&target.butler) {
                endpoints.insert(target.butler.clone(), url.clone());
            }
        }
        endpoints
    }

    async fn record_outcomes(
        &self,
        request_id: Uuid,
        envelope: &IngressEnvelope,
        outcomes: &[DispatchOutcome],
    ) -> Result<()> {
        for outcome in outcomes {
            swb_db::append_dispatch_outcome(&self.pool, request_id, outcome).await?;

            swb_db::insert_routing_log(
                &self.pool,
                &NewRoutingLog {
                    request_id: Some(request_id),
                    source_butler: "switchboard".to_string(),
                    target_butler: outcome.butler.clone(),
                    tool_name: "route.v1".to_string(),
                    success: outcome.success,
                    duration_ms: Some(outcome.duration_ms as i32),
                    error: outcome.error_category.map(|c| c.as_str().to_string()),
                    source_endpoint_identity: Some(envelope.source.endpoint_identity.clone()),
                    source_sender_identity: Some(envelope.sender.identity.clone()),
                    source_thread_identity: envelope.event.external_thread_id.clone(),
                },
            )
            .await?;

            swb_db::record_fanout_dispatch(
                &self.pool,
                &envelope.source.channel,
                &outcome.butler,
                outcome.success,
            )
            .await?;

            self.metrics
                .dispatches
                .get_or_create(&DispatchLabels {
                    destination_butler: outcome.butler.clone(),
                    outcome: if outcome.success { "success" } else { "failure" }.to_string(),
                })
                .inc();
            self.metrics
                .subroute_seconds
                .get_or_create(&TargetLabels {
                    destination_butler: outcome.butler.clone(),
                })
                .observe(outcome.duration_ms as f64 / 1000.0);

            if outcome.success {
                swb_db::touch_heartbeat(&self.pool, &outcome.butler).await?;
            }
        }
        Ok(())
    }

    async fn pin_affinity(
        &self,
        envelope: &IngressEnvelope,
        outcomes: &[DispatchOutcome],
    ) -> Result<()> {
        let Some((channel, thread)) = envelope.thread_key() else {
            return Ok(());
        };
        let Some(first_success) = outcomes.iter().find(|o| o.success) else {
            return Ok(());
        };
        swb_db::upsert_thread_affinity(&self.pool, channel, thread, &first_success.butler).await
    }

    async fn dead_letter(
        &self,
        request_id: Uuid,
        envelope: &IngressEnvelope,
        outcomes: &[DispatchOutcome],
    ) -> Result<()> {
        // A failure with retriable categories means the per-target retry
        // budget ran out; non-retriable failures keep their own category.
        // Overload is an ingress-time signal, not a DLQ category (the table
        // constraint enforces the closed set), so it files as retry_exhausted.
        let proximate = outcomes
            .iter()
            .filter_map(|o| o.error_category)
            .next_back()
            .unwrap_or(ErrorCategory::Unknown);
        let category = if proximate.is_retriable() || proximate == ErrorCategory::Overload {
            ErrorCategory::RetryExhausted
        } else {
            proximate
        };

        let dlq_id = swb_db::insert_dead_letter(
            &self.pool,
            &swb_db::NewDeadLetter {
                original_request_id: request_id,
                failure_reason: format!("dispatch failed: {category}"),
                failure_category: category,
                retry_count: self.cfg.dispatch.retry_max_attempts as i32,
                original_payload: serde_json::to_value(envelope).context("serialize envelope")?,
                error_details: serde_json::to_value(outcomes).context("serialize outcomes")?,
            },
        )
        .await?;

        self.advance(request_id, LifecycleState::Failed, LifecycleState::DeadLettered)
            .await?;

        self.metrics
            .dead_lettered
            .get_or_create(&ErrorClassLabels {
                error_class: category.as_str().to_string(),
            })
            .inc();

        warn!(request_id = %request_id, dlq_id = %dlq_id, category = %category, "request dead-lettered");
        Ok(())
    }

    async fn advance(
        &self,
        request_id: Uuid,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<bool> {
        let moved = swb_db::transition_lifecycle(&self.pool, request_id, from, to).await?;
        if moved {
            self.metrics
                .lifecycle_transitions
                .get_or_create(&LifecycleLabels {
                    lifecycle_state: to.as_str().to_string(),
                })
                .inc();
        } else {
            warn!(request_id = %request_id, from = %from, to = %to, "lifecycle transition lost the race");
        }
        Ok(moved)
    }
}
