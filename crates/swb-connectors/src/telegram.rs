//! Telegram adapter: update JSON → `ingest.v1`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use swb_schemas::{
    Attachment, EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
    IngressEnvelope, PolicyTier, SCHEMA_INGEST_V1,
};

/// The subset of a Telegram update the switchboard cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: TelegramMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub date: i64,
    pub chat: TelegramChat,
    pub from: TelegramUser,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub photo: Vec<TelegramPhotoSize>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

fn observed_at(unix_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix_secs, 0).single().unwrap_or_else(Utc::now)
}

/// Translate one update. `bot_identity` is the connector endpoint identity
/// (the bot id); `raw` is kept verbatim for audit and replay.
pub fn envelope_from_update(
    bot_identity: &str,
    update: &TelegramUpdate,
    raw: Value,
) -> IngressEnvelope {
    let mut attachments = Vec::new();
    // Telegram sends photos as a size ladder; the largest is last.
    if let Some(best) = update.message.photo.last() {
        attachments.push(Attachment {
            kind: "photo".to_string(),
            name: None,
            content_ref: Some(best.file_id.clone()),
            size_bytes: best.file_size,
        });
    }
    if let Some(doc) = &update.message.document {
        attachments.push(Attachment {
            kind: "document".to_string(),
            name: doc.file_name.clone(),
            content_ref: Some(doc.file_id.clone()),
            size_bytes: doc.file_size,
        });
    }

    let display = update
        .message
        .from
        .username
        .clone()
        .or_else(|| update.message.from.first_name.clone());

    IngressEnvelope {
        schema_version: SCHEMA_INGEST_V1.to_string(),
        source: EnvelopeSource {
            channel: "telegram".to_string(),
            provider: "telegram".to_string(),
            endpoint_identity: bot_identity.to_string(),
        },
        event: EnvelopeEvent {
            external_event_id: update.update_id.to_string(),
            external_thread_id: Some(
                update
                    .message
                    .message_thread_id
                    .map(|t| format!("{}:{}", update.message.chat.id, t))
                    .unwrap_or_else(|| update.message.chat.id.to_string()),
            ),
            observed_at: observed_at(update.message.date),
        },
        sender: EnvelopeSender {
            identity: update.message.from.id.to_string(),
            display,
            roles: None,
        },
        payload: EnvelopePayload {
            raw,
            normalized_text: update.message.text.clone(),
            attachments,
        },
        control: EnvelopeControl {
            // Interactive chat is latency-sensitive.
            policy_tier: PolicyTier::Realtime,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_json() -> Value {
        json!({
            "update_id": 7001,
            "message": {
                "date": 1772236800,
                "chat": { "id": 4242 },
                "from": { "id": 99, "username": "ada" },
                "text": "/health bp 120 80"
            }
        })
    }

    #[test]
    fn translates_text_update() {
        let raw = update_json();
        let update: TelegramUpdate = serde_json::from_value(raw.clone()).unwrap();
        let env = envelope_from_update("bot-1", &update, raw);

        assert_eq!(env.source.channel, "telegram");
        assert_eq!(env.event.external_event_id, "7001");
        assert_eq!(env.event.external_thread_id.as_deref(), Some("4242"));
        assert_eq!(env.sender.identity, "99");
        assert_eq!(env.text(), "/health bp 120 80");
        assert_eq!(env.control.policy_tier, PolicyTier::Realtime);
        assert!(env.validate_and_normalize().is_ok());
    }

    #[test]
    fn photo_ladder_takes_largest() {
        let raw = json!({
            "update_id": 7002,
            "message": {
                "date": 1772236800,
                "chat": { "id": 4242 },
                "from": { "id": 99 },
                "photo": [
                    { "file_id": "small", "file_size": 100 },
                    { "file_id": "large", "file_size": 9000 }
                ]
            }
        });
        let update: TelegramUpdate = serde_json::from_value(raw.clone()).unwrap();
        let env = envelope_from_update("bot-1", &update, raw);

        assert_eq!(env.payload.attachments.len(), 1);
        assert_eq!(env.payload.attachments[0].content_ref.as_deref(), Some("large"));
        assert_eq!(env.payload.attachments[0].kind, "photo");
    }

    #[test]
    fn forum_thread_id_is_scoped_to_chat() {
        let raw = json!({
            "update_id": 7003,
            "message": {
                "date": 1772236800,
                "chat": { "id": 4242 },
                "from": { "id": 99 },
                "text": "hi",
                "message_thread_id": 7
            }
        });
        let update: TelegramUpdate = serde_json::from_value(raw.clone()).unwrap();
        let env = envelope_from_update("bot-1", &update, raw);
        assert_eq!(env.event.external_thread_id.as_deref(), Some("4242:7"));
    }
}
