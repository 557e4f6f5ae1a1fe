//! Switchboard metrics: counters, histograms, and gauges under one registry.
//!
//! Cardinality discipline: every label set is a fixed struct of identifiers
//! drawn from closed sets (channel, butler name, outcome, tier, ...). Free
//! text never becomes a label.

use std::sync::Mutex;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceLabels {
    pub source: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabels {
    pub policy_tier: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    pub destination_butler: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabels {
    pub destination_butler: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LifecycleLabels {
    pub lifecycle_state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorClassLabels {
    pub error_class: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ParseSourceLabels {
    pub parse_source: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FanoutLabels {
    pub fanout_mode: String,
}

fn latency_histogram() -> Histogram {
    // 1ms .. ~65s, doubling.
    Histogram::new((0..17).map(|i| 0.001 * 2f64.powi(i)))
}

pub struct SwitchboardMetrics {
    registry: Mutex<Registry>,

    pub received: Family<SourceLabels, Counter>,
    pub duplicates: Family<SourceLabels, Counter>,
    pub overload: Family<TierLabels, Counter>,
    pub triage_short_circuit: Family<SourceLabels, Counter>,
    pub classifier_fallback: Counter,
    pub classifier_parse_failure: Counter,
    pub dispatches: Family<DispatchLabels, Counter>,
    pub retries: Family<TargetLabels, Counter>,
    pub lifecycle_transitions: Family<LifecycleLabels, Counter>,
    pub circuit_opened: Family<TargetLabels, Counter>,
    pub dead_lettered: Family<ErrorClassLabels, Counter>,

    pub ingress_accept_seconds: Histogram,
    pub routing_decision_seconds: Family<ParseSourceLabels, Histogram>,
    pub subroute_seconds: Family<TargetLabels, Histogram>,
    pub fanout_completion_seconds: Family<FanoutLabels, Histogram>,
    pub end_to_end_seconds: Histogram,

    pub queue_depth: Family<TierLabels, Gauge>,
    pub in_flight: Gauge,
    pub open_circuits: Gauge,
}

impl SwitchboardMetrics {
    pub fn new(namespace: &str) -> Self {
        let mut registry = Registry::with_prefix(namespace);

        let received = Family::<SourceLabels, Counter>::default();
        registry.register("received", "Envelopes accepted at ingest", received.clone());

        let duplicates = Family::<SourceLabels, Counter>::default();
        registry.register("duplicate", "Ingest dedup hits", duplicates.clone());

        let overload = Family::<TierLabels, Counter>::default();
        registry.register("overload", "Ingress rejected by backpressure", overload.clone());

        let triage_short_circuit = Family::<SourceLabels, Counter>::default();
        registry.register(
            "triage_short_circuit",
            "Requests routed by triage without the classifier",
            triage_short_circuit.clone(),
        );

        let classifier_fallback = Counter::default();
        registry.register(
            "classifier_fallback",
            "Classification failures that fell back to the default target",
            classifier_fallback.clone(),
        );

        let classifier_parse_failure = Counter::default();
        registry.register(
            "classifier_parse_failure",
            "Classifier responses that were not valid route decisions",
            classifier_parse_failure.clone(),
        );

        let dispatches = Family::<DispatchLabels, Counter>::default();
        registry.register("subroute", "Per-target dispatch outcomes", dispatches.clone());

        let retries = Family::<TargetLabels, Counter>::default();
        registry.register("retry", "Dispatch retries scheduled", retries.clone());

        let lifecycle_transitions = Family::<LifecycleLabels, Counter>::default();
        registry.register(
            "lifecycle_transition",
            "Inbox lifecycle transitions, labeled by destination state",
            lifecycle_transitions.clone(),
        );

        let circuit_opened = Family::<TargetLabels, Counter>::default();
        registry.register("circuit_opened", "Circuit breaker trips", circuit_opened.clone());

        let dead_lettered = Family::<ErrorClassLabels, Counter>::default();
        registry.register("dead_lettered", "Requests moved to the DLQ", dead_lettered.clone());

        let ingress_accept_seconds = latency_histogram();
        registry.register(
            "ingress_accept_seconds",
            "Ingest accept latency (excluding classification)",
            ingress_accept_seconds.clone(),
        );

        let routing_decision_seconds =
            Family::<ParseSourceLabels, Histogram>::new_with_constructor(latency_histogram);
        registry.register(
            "routing_decision_seconds",
            "Time to a route decision, by provenance",
            routing_decision_seconds.clone(),
        );

        let subroute_seconds =
            Family::<TargetLabels, Histogram>::new_with_constructor(latency_histogram);
        registry.register(
            "subroute_seconds",
            "Per-target dispatch latency",
            subroute_seconds.clone(),
        );

        let fanout_completion_seconds =
            Family::<FanoutLabels, Histogram>::new_with_constructor(latency_histogram);
        registry.register(
            "fanout_completion_seconds",
            "Fanout completion latency, by mode",
            fanout_completion_seconds.clone(),
        );

        let end_to_end_seconds = latency_histogram();
        registry.register(
            "end_to_end_seconds",
            "Receipt to terminal lifecycle state",
            end_to_end_seconds.clone(),
        );

        let queue_depth = Family::<TierLabels, Gauge>::default();
        registry.register("queue_depth", "Durable buffer depth per tier", queue_depth.clone());

        let in_flight = Gauge::default();
        registry.register("in_flight", "Dispatches currently in flight", in_flight.clone());

        let open_circuits = Gauge::default();
        registry.register("open_circuits", "Circuits currently not closed", open_circuits.clone());

        Self {
            registry: Mutex::new(registry),
            received,
            duplicates,
            overload,
            triage_short_circuit,
            classifier_fallback,
            classifier_parse_failure,
            dispatches,
            retries,
            lifecycle_transitions,
            circuit_opened,
            dead_lettered,
            ingress_accept_seconds,
            routing_decision_seconds,
            subroute_seconds,
            fanout_completion_seconds,
            end_to_end_seconds,
            queue_depth,
            in_flight,
            open_circuits,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut out = String::new();
        let registry = self.registry.lock().expect("metrics registry lock poisoned");
        encode(&mut out, &registry)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_with_namespace_prefix() {
        let m = SwitchboardMetrics::new("switchboard");
        m.received
            .get_or_create(&SourceLabels { source: "telegram".to_string() })
            .inc();
        m.in_flight.set(3);
        m.ingress_accept_seconds.observe(0.004);

        let text = m.render().unwrap();
        assert!(text.contains("switchboard_received_total"));
        assert!(text.contains("source=\"telegram\""));
        assert!(text.contains("switchboard_in_flight 3"));
    }

    #[test]
    fn families_keep_label_sets_apart() {
        let m = SwitchboardMetrics::new("switchboard");
        m.dispatches
            .get_or_create(&DispatchLabels {
                destination_butler: "health".to_string(),
                outcome: "success".to_string(),
            })
            .inc();
        m.dispatches
            .get_or_create(&DispatchLabels {
                destination_butler: "health".to_string(),
                outcome: "failure".to_string(),
            })
            .inc();

        let text = m.render().unwrap();
        assert!(text.contains("outcome=\"success\""));
        assert!(text.contains("outcome=\"failure\""));
    }
}
