//! Triage rule domain types, parsed from the JSONB columns of `triage_rules`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use swb_db::TriageRuleRow;
use swb_schemas::{IngressEnvelope, PolicyTier};

/// Conditions are an AND of the predicates present. Closed field set: an
/// unknown predicate key fails the parse, so a typo'd rule is rejected at
/// load time instead of silently matching everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_in: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_starts_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_tier: Option<PolicyTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,
}

impl TriageConditions {
    /// Pure predicate over envelope fields.
    pub fn matches(&self, env: &IngressEnvelope) -> bool {
        if let Some(channel) = &self.channel {
            if !env.source.channel.eq_ignore_ascii_case(channel) {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if !env.source.provider.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &env.sender.identity != sender {
                return false;
            }
        }
        if let Some(senders) = &self.sender_in {
            if !senders.iter().any(|s| s == &env.sender.identity) {
                return false;
            }
        }
        if let Some(prefix) = &self.text_starts_with {
            if !env.text().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.text_contains {
            if !env.text().contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(tier) = self.policy_tier {
            if env.control.policy_tier != tier {
                return false;
            }
        }
        if let Some(wants) = self.has_attachments {
            if env.payload.attachments.is_empty() == wants {
                return false;
            }
        }
        true
    }
}

/// What a matching rule asks for. Side-effect-free descriptors only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriageAction {
    /// Route straight to one butler with a rendered prompt.
    ShortCircuitTo {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_template: Option<String>,
    },
    /// Route to these butlers without calling the classifier.
    BypassClassifierWith { targets: Vec<String> },
    /// Hand the envelope to the classifier.
    Escalate,
    /// Discard: the request completes with nothing dispatched.
    Drop,
}

impl TriageAction {
    /// Render the short-circuit prompt. `{text}` expands to the normalized
    /// envelope text; a rule without a template passes the text through.
    pub fn render_prompt(&self, env: &IngressEnvelope) -> Option<String> {
        match self {
            TriageAction::ShortCircuitTo { prompt_template, .. } => Some(
                prompt_template
                    .as_deref()
                    .map(|t| t.replace("{text}", env.text()))
                    .unwrap_or_else(|| env.text().to_string()),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriageRule {
    pub id: Uuid,
    pub priority: i32,
    pub conditions: TriageConditions,
    pub action: TriageAction,
    pub created_at: DateTime<Utc>,
}

/// A rule row whose JSON columns do not parse. Reported once at load time;
/// the rule is excluded from the active set.
#[derive(Debug)]
pub struct RuleParseError {
    pub rule_id: Uuid,
    pub source: serde_json::Error,
}

impl std::fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "triage rule {} failed to parse: {}", self.rule_id, self.source)
    }
}

impl std::error::Error for RuleParseError {}

impl TriageRule {
    pub fn from_row(row: &TriageRuleRow) -> Result<Self, RuleParseError> {
        let conditions: TriageConditions = serde_json::from_value(row.conditions.clone())
            .map_err(|source| RuleParseError { rule_id: row.id, source })?;
        let action: TriageAction = serde_json::from_value(row.action.clone())
            .map_err(|source| RuleParseError { rule_id: row.id, source })?;
        Ok(Self {
            id: row.id,
            priority: row.priority,
            conditions,
            action,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swb_schemas::{
        EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
        SCHEMA_INGEST_V1,
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
                external_thread_id: None,
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

    #[test]
    fn conditions_are_an_and() {
        let c: TriageConditions = serde_json::from_value(json!({
            "channel": "telegram",
            "text_starts_with": "/health"
        }))
        .unwrap();

        assert!(c.matches(&env_with_text("/health bp 120 80")));
        assert!(!c.matches(&env_with_text("hello")));

        let mut other_channel = env_with_text("/health bp 120 80");
        other_channel.source.channel = "email".to_string();
        assert!(!c.matches(&other_channel));
    }

    #[test]
    fn unknown_predicate_is_rejected() {
        let err = serde_json::from_value::<TriageConditions>(json!({
            "text_startswith": "/oops"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn action_json_round_trips() {
        let a: TriageAction = serde_json::from_value(json!({
            "type": "short_circuit_to",
            "target": "health",
            "prompt_template": "User said: {text}"
        }))
        .unwrap();

        let env = env_with_text("/health bp 120 80");
        assert_eq!(
            a.render_prompt(&env).as_deref(),
            Some("User said: /health bp 120 80")
        );

        let b: TriageAction =
            serde_json::from_value(json!({"type": "bypass_classifier_with", "targets": ["a"]}))
                .unwrap();
        assert_eq!(b, TriageAction::BypassClassifierWith { targets: vec!["a".to_string()] });
        assert_eq!(b.render_prompt(&env), None);
    }
}
