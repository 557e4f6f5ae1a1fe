//! The triage evaluation step.
//!
//! Order of precedence:
//! 1. Thread affinity: a live `(channel, thread)` pin bypasses the
//!    classifier and routes to the last target.
//! 2. Rules, in `priority ASC, created_at ASC` order; first match wins.
//! 3. No match: escalate to the classifier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use swb_schemas::{IngressEnvelope, ParseSource, RouteDecision, RouteTarget};

use crate::rule::{TriageAction, TriageRule};

/// What triage decided for one envelope. Persisted verbatim into
/// `message_inbox.triage_outcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageDecision {
    pub verdict: TriageVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<Uuid>,
    pub affinity_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriageVerdict {
    /// Dispatch without consulting the classifier.
    Route { decision: RouteDecision },
    /// Hand off to the classifier.
    Escalate,
    /// Discard; the request completes with nothing dispatched.
    Drop,
}

/// Evaluate triage for an envelope.
///
/// `affinity_target` is the caller-resolved thread pin (the lookup is I/O,
/// so it happens outside this pure function). Rules must already be in
/// evaluation order; the cache guarantees that.
pub fn evaluate_triage(
    env: &IngressEnvelope,
    rules: &[TriageRule],
    affinity_target: Option<&str>,
) -> TriageDecision {
    if let Some(target) = affinity_target {
        let decision =
            RouteDecision::single(RouteTarget::named(target), ParseSource::Triage);
        return TriageDecision {
            verdict: TriageVerdict::Route { decision },
            matched_rule: None,
            affinity_hit: true,
        };
    }

    for rule in rules {
        if !rule.conditions.matches(env) {
            continue;
        }
        let verdict = match &rule.action {
            TriageAction::ShortCircuitTo { target, .. } => {
                let mut t = RouteTarget::named(target.clone());
                t.prompt = rule.action.render_prompt(env);
                TriageVerdict::Route {
                    decision: RouteDecision::single(t, ParseSource::Triage),
                }
            }
            TriageAction::BypassClassifierWith { targets } => {
                let mut decision = RouteDecision::single(
                    RouteTarget::named(
                        targets.first().cloned().unwrap_or_default(),
                    ),
                    ParseSource::Triage,
                );
                decision.targets =
                    targets.iter().cloned().map(RouteTarget::named).collect();
                TriageVerdict::Route { decision }
            }
            TriageAction::Escalate => TriageVerdict::Escalate,
            TriageAction::Drop => TriageVerdict::Drop,
        };
        return TriageDecision {
            verdict,
            matched_rule: Some(rule.id),
            affinity_hit: false,
        };
    }

    TriageDecision {
        verdict: TriageVerdict::Escalate,
        matched_rule: None,
        affinity_hit: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::TriageConditions;
    use chrono::Utc;
    use serde_json::json;
    use swb_schemas::{
        EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
        PolicyTier, SCHEMA_INGEST_V1,
    };

    fn env_with_text(text: &str) -> IngressEnvelope {
        IngressEnvelope {
            schema_version: SCHEMA_INGEST_V1.to_string(),
            source: EnvelopeSource {
                channel: "telegram".to_string(),
                provider: "telegram".to_string(),
                endpoint_identity: "bot".to_string(),
            },
            event: EnvelopeEvent {
                external_event_id: "e1".to_string(),
                external_thread_id: Some("th-1".to_string()),
                observed_at: Utc::now(),
            },
            sender: EnvelopeSender {
                identity: "u1".to_string(),
                display: None,
                roles: None,
            },
            payload: EnvelopePayload {
                raw: json!({}),
                normalized_text: Some(text.to_string()),
                attachments: vec![],
            },
            control: EnvelopeControl {
                policy_tier: PolicyTier::Default,
            },
        }
    }

    fn health_rule(priority: i32) -> TriageRule {
        TriageRule {
            id: Uuid::new_v4(),
            priority,
            conditions: serde_json::from_value(json!({
                "channel": "telegram",
                "text_starts_with": "/health"
            }))
            .unwrap(),
            action: TriageAction::ShortCircuitTo {
                target: "health".to_string(),
                prompt_template: None,
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn short_circuit_matches_and_carries_provenance() {
        let rules = vec![health_rule(10)];
        let d = evaluate_triage(&env_with_text("/health bp 120 80"), &rules, None);

        assert_eq!(d.matched_rule, Some(rules[0].id));
        match d.verdict {
            TriageVerdict::Route { decision } => {
                assert_eq!(decision.targets[0].butler, "health");
                assert_eq!(decision.parse_source, ParseSource::Triage);
            }
            other => panic!("expected route verdict, got {other:?}"),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let first = health_rule(10);
        let mut second = health_rule(20);
        second.action = TriageAction::Drop;
        let expected = first.id;

        let d = evaluate_triage(&env_with_text("/health x"), &[first, second], None);
        assert_eq!(d.matched_rule, Some(expected));
    }

    #[test]
    fn affinity_takes_precedence_over_rules() {
        let rules = vec![health_rule(10)];
        let d = evaluate_triage(&env_with_text("/health x"), &rules, Some("relationship"));

        assert!(d.affinity_hit);
        assert_eq!(d.matched_rule, None);
        match d.verdict {
            TriageVerdict::Route { decision } => {
                assert_eq!(decision.targets[0].butler, "relationship");
                assert_eq!(decision.parse_source, ParseSource::Triage);
            }
            other => panic!("expected route verdict, got {other:?}"),
        }
    }

    #[test]
    fn no_match_escalates() {
        let rules = vec![health_rule(10)];
        let d = evaluate_triage(&env_with_text("unrelated"), &rules, None);
        assert!(matches!(d.verdict, TriageVerdict::Escalate));
        assert_eq!(d.matched_rule, None);
    }

    #[test]
    fn empty_conditions_match_everything() {
        let rule = TriageRule {
            id: Uuid::new_v4(),
            priority: 1,
            conditions: TriageConditions::default(),
            action: TriageAction::Drop,
            created_at: Utc::now(),
        };
        let d = evaluate_triage(&env_with_text("anything"), &[rule], None);
        assert!(matches!(d.verdict, TriageVerdict::Drop));
    }
}
