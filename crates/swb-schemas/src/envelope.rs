//! `ingest.v1`: the canonical immutable boundary object between connectors
//! and the switchboard core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SCHEMA_INGEST_V1: &str = "ingest.v1";

/// Canonical inbound event. Immutable once accepted; the inbox row stores it
/// verbatim as a JSONB document.
///
/// `(source.channel, event.external_event_id)` uniquely identifies an inbound
/// event at its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressEnvelope {
    pub schema_version: String,
    pub source: EnvelopeSource,
    pub event: EnvelopeEvent,
    pub sender: EnvelopeSender,
    pub payload: EnvelopePayload,
    pub control: EnvelopeControl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeSource {
    /// Delivery channel, e.g. "telegram", "email". Normalized to lowercase.
    pub channel: String,
    /// Upstream provider, e.g. "telegram", "gmail". Normalized to lowercase.
    pub provider: String,
    /// Identity of the connector endpoint (bot id, mailbox address).
    pub endpoint_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeEvent {
    /// Source-assigned event id (telegram update id, message-id header, ...).
    pub external_event_id: String,
    /// Conversation/thread identity at the source, when the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    /// When the source says the event happened. Out-of-order values are
    /// accepted; receipt order is preserved separately via `received_at`.
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeSender {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopePayload {
    /// Raw provider payload, kept verbatim for audit and replay.
    pub raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attachment {
    /// Media kind, e.g. "photo", "document", "audio".
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Opaque reference into the source's storage (file id, attachment cid).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeControl {
    pub policy_tier: super::route::PolicyTier,
}

/// Canonical ingest response returned to connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAccepted {
    /// Always "accepted"; a malformed envelope never reaches this type.
    pub status: String,
    pub request_id: Uuid,
    pub duplicate: bool,
}

impl IngestAccepted {
    pub fn new(request_id: Uuid, duplicate: bool) -> Self {
        Self {
            status: "accepted".to_string(),
            request_id,
            duplicate,
        }
    }
}

/// A structurally well-formed envelope that violates a semantic requirement.
///
/// Connectors receive this as a 400 with `error_category=validation_error`
/// and are expected to retry with a corrected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid envelope: {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError {
            field,
            reason: "must be non-empty".to_string(),
        });
    }
    Ok(())
}

impl IngressEnvelope {
    /// Validate semantic requirements and normalize identifier casing.
    ///
    /// Serde already enforces presence and closed field sets; this rejects
    /// wrong schema versions and empty identity fields, then lowercases
    /// `source.channel` / `source.provider` so downstream matching is
    /// case-insensitive by construction.
    pub fn validate_and_normalize(mut self) -> Result<Self, ValidationError> {
        if self.schema_version != SCHEMA_INGEST_V1 {
            return Err(ValidationError {
                field: "schema_version",
                reason: format!(
                    "expected {:?}, got {:?}",
                    SCHEMA_INGEST_V1, self.schema_version
                ),
            });
        }

        require("source.channel", &self.source.channel)?;
        require("source.provider", &self.source.provider)?;
        require("source.endpoint_identity", &self.source.endpoint_identity)?;
        require("sender.identity", &self.sender.identity)?;
        require("event.external_event_id", &self.event.external_event_id)?;

        self.source.channel = self.source.channel.to_ascii_lowercase();
        self.source.provider = self.source.provider.to_ascii_lowercase();

        Ok(self)
    }

    /// The normalized text if present, else an empty string. Triage predicates
    /// operate on this.
    pub fn text(&self) -> &str {
        self.payload.normalized_text.as_deref().unwrap_or("")
    }

    /// `(channel, external_thread_id)` when the source supplied a thread.
    pub fn thread_key(&self) -> Option<(&str, &str)> {
        self.event
            .external_thread_id
            .as_deref()
            .map(|t| (self.source.channel.as_str(), t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::PolicyTier;
    use serde_json::json;

    fn envelope_json() -> Value {
        json!({
            "schema_version": "ingest.v1",
            "source": {
                "channel": "Telegram",
                "provider": "Telegram",
                "endpoint_identity": "bot-123"
            },
            "event": {
                "external_event_id": "evt-1",
                "external_thread_id": "thread-456",
                "observed_at": "2026-03-01T00:00:00Z"
            },
            "sender": { "identity": "user-789" },
            "payload": {
                "raw": { "text": "hi" },
                "normalized_text": "hi"
            },
            "control": { "policy_tier": "default" }
        })
    }

    #[test]
    fn parses_and_normalizes_channel_casing() {
        let env: IngressEnvelope = serde_json::from_value(envelope_json()).unwrap();
        let env = env.validate_and_normalize().unwrap();
        assert_eq!(env.source.channel, "telegram");
        assert_eq!(env.source.provider, "telegram");
        assert_eq!(env.control.policy_tier, PolicyTier::Default);
        assert_eq!(env.thread_key(), Some(("telegram", "thread-456")));
    }

    #[test]
    fn missing_external_event_id_fails_deserialization() {
        let mut v = envelope_json();
        v["event"].as_object_mut().unwrap().remove("external_event_id");
        let err = serde_json::from_value::<IngressEnvelope>(v).unwrap_err();
        assert!(err.to_string().contains("external_event_id"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut v = envelope_json();
        v["source"]
            .as_object_mut()
            .unwrap()
            .insert("extra".to_string(), json!("nope"));
        assert!(serde_json::from_value::<IngressEnvelope>(v).is_err());
    }

    #[test]
    fn wrong_schema_version_is_a_validation_error() {
        let mut v = envelope_json();
        v["schema_version"] = json!("ingest.v2");
        let env: IngressEnvelope = serde_json::from_value(v).unwrap();
        let err = env.validate_and_normalize().unwrap_err();
        assert_eq!(err.field, "schema_version");
    }

    #[test]
    fn empty_sender_identity_is_a_validation_error() {
        let mut v = envelope_json();
        v["sender"]["identity"] = json!("  ");
        let env: IngressEnvelope = serde_json::from_value(v).unwrap();
        let err = env.validate_and_normalize().unwrap_err();
        assert_eq!(err.field, "sender.identity");
    }
}
