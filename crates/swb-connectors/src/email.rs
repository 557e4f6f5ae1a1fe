//! Email adapter: message summaries → `ingest.v1`.
//!
//! The mailbox client lives outside the core; this module only translates
//! its summaries. Message-ID gives event identity; the references chain
//! root gives thread identity, so replies keep conversational affinity.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use swb_schemas::{
    Attachment, EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
    IngressEnvelope, PolicyTier, SCHEMA_INGEST_V1,
};

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSummary {
    pub message_id: String,
    pub from_address: String,
    #[serde(default)]
    pub from_display: Option<String>,
    pub subject: String,
    pub received: DateTime<Utc>,
    #[serde(default)]
    pub body_text: Option<String>,
    /// Root of the References chain, when threading headers exist.
    #[serde(default)]
    pub thread_root: Option<String>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    /// Bulk mail per list headers (List-Unsubscribe, Precedence: bulk).
    #[serde(default)]
    pub is_bulk: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

pub fn envelope_from_email(mailbox: &str, mail: &EmailSummary, raw: Value) -> IngressEnvelope {
    let text = match &mail.body_text {
        Some(body) => format!("{}\n\n{}", mail.subject, body),
        None => mail.subject.clone(),
    };

    IngressEnvelope {
        schema_version: SCHEMA_INGEST_V1.to_string(),
        source: EnvelopeSource {
            channel: "email".to_string(),
            provider: "imap".to_string(),
            endpoint_identity: mailbox.to_string(),
        },
        event: EnvelopeEvent {
            external_event_id: mail.message_id.clone(),
            external_thread_id: mail.thread_root.clone(),
            observed_at: mail.received,
        },
        sender: EnvelopeSender {
            identity: mail.from_address.clone(),
            display: mail.from_display.clone(),
            roles: None,
        },
        payload: EnvelopePayload {
            raw,
            normalized_text: Some(text),
            attachments: mail
                .attachments
                .iter()
                .map(|a| Attachment {
                    kind: a.content_type.clone(),
                    name: Some(a.filename.clone()),
                    content_ref: None,
                    size_bytes: a.size_bytes,
                })
                .collect(),
        },
        control: EnvelopeControl {
            policy_tier: if mail.is_bulk {
                PolicyTier::Bulk
            } else {
                PolicyTier::Default
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary() -> EmailSummary {
        EmailSummary {
            message_id: "<abc@mail.example>".to_string(),
            from_address: "ada@example.com".to_string(),
            from_display: Some("Ada".to_string()),
            subject: "Dinner friday?".to_string(),
            received: "2026-03-01T10:00:00Z".parse().unwrap(),
            body_text: Some("Are you free?".to_string()),
            thread_root: Some("<root@mail.example>".to_string()),
            attachments: vec![],
            is_bulk: false,
        }
    }

    #[test]
    fn subject_and_body_become_normalized_text() {
        let env = envelope_from_email("inbox@example.com", &summary(), json!({}));
        assert_eq!(env.text(), "Dinner friday?\n\nAre you free?");
        assert_eq!(env.event.external_event_id, "<abc@mail.example>");
        assert_eq!(env.event.external_thread_id.as_deref(), Some("<root@mail.example>"));
        assert_eq!(env.control.policy_tier, PolicyTier::Default);
        assert!(env.validate_and_normalize().is_ok());
    }

    #[test]
    fn bulk_mail_lands_in_the_bulk_tier() {
        let mut mail = summary();
        mail.is_bulk = true;
        let env = envelope_from_email("inbox@example.com", &mail, json!({}));
        assert_eq!(env.control.policy_tier, PolicyTier::Bulk);
    }
}
