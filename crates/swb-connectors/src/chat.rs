//! Generic chat webhook adapter for providers that push events to us.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use swb_schemas::{
    EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
    IngressEnvelope, PolicyTier, SCHEMA_INGEST_V1,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatEvent {
    pub event_id: String,
    pub workspace: String,
    pub sender: String,
    #[serde(default)]
    pub sender_display: Option<String>,
    #[serde(default)]
    pub thread: Option<String>,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

pub fn envelope_from_chat_event(provider: &str, event: &ChatEvent, raw: Value) -> IngressEnvelope {
    IngressEnvelope {
        schema_version: SCHEMA_INGEST_V1.to_string(),
        source: EnvelopeSource {
            channel: "chat".to_string(),
            provider: provider.to_string(),
            endpoint_identity: event.workspace.clone(),
        },
        event: EnvelopeEvent {
            external_event_id: event.event_id.clone(),
            external_thread_id: event.thread.clone(),
            observed_at: event.sent_at,
        },
        sender: EnvelopeSender {
            identity: event.sender.clone(),
            display: event.sender_display.clone(),
            roles: None,
        },
        payload: EnvelopePayload {
            raw,
            normalized_text: Some(event.text.clone()),
            attachments: vec![],
        },
        control: EnvelopeControl {
            policy_tier: PolicyTier::Default,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translates_chat_event() {
        let event = ChatEvent {
            event_id: "ev-1".to_string(),
            workspace: "ws-main".to_string(),
            sender: "U123".to_string(),
            sender_display: None,
            thread: Some("C9.1650000000".to_string()),
            text: "remind me tomorrow".to_string(),
            sent_at: "2026-03-01T09:00:00Z".parse().unwrap(),
        };
        let env = envelope_from_chat_event("slack", &event, json!({}));

        assert_eq!(env.source.channel, "chat");
        assert_eq!(env.source.provider, "slack");
        assert_eq!(env.event.external_thread_id.as_deref(), Some("C9.1650000000"));
        assert!(env.validate_and_normalize().is_ok());
    }
}
