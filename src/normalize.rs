//! Channel Normalizer — converts platform-specific inbound payloads into the
//! canonical [`InboundMessage`].
//!
//! Structural decoding only: no tenant lookup, no business logic. A payload
//! that cannot be decoded is rejected with [`NormalizeError`] so the channel
//! adapter can acknowledge it; it is never silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NormalizeError;

// ── Channel & message types ─────────────────────────────────────────

/// Source channel of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Telegram,
    Whatsapp,
    Sms,
    Email,
    Voice,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Voice => "voice",
        };
        write!(f, "{s}")
    }
}

/// Channel-derived tenant routing hint. Unverified — the Tenant Resolver
/// turns it into a binding or rejects the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TenantHint {
    /// Bot token/identifier the message was delivered to (chat platforms).
    BotId(String),
    /// Receiving phone number or voice line.
    PhoneNumber(String),
    /// Inbound routing slug (e.g. the local part of an inbound address).
    RouteSlug(String),
}

impl TenantHint {
    /// The raw identity string used for routing-table lookup.
    pub fn identity(&self) -> &str {
        match self {
            Self::BotId(s) | Self::PhoneNumber(s) | Self::RouteSlug(s) => s,
        }
    }
}

/// Opaque reference to an attachment carried by a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub kind: String,
}

/// Canonical inbound message. Immutable — created by the normalizer,
/// discarded after the turn completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: Channel,
    /// Channel-native sender identifier (chat user id, phone number, address).
    pub external_user_id: String,
    pub tenant_hint: TenantHint,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

// ── Raw payload shapes ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TelegramPayload {
    bot_id: String,
    message: TelegramMessage,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    from: TelegramUser,
    text: Option<String>,
    #[serde(default)]
    photo: Vec<TelegramPhoto>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramPhoto {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct WhatsappPayload {
    /// Receiving business number.
    to: String,
    from: String,
    body: Option<String>,
    #[serde(default)]
    media: Vec<WhatsappMedia>,
}

#[derive(Debug, Deserialize)]
struct WhatsappMedia {
    id: String,
    #[serde(default)]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
struct SmsPayload {
    to: String,
    from: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct EmailPayload {
    /// Inbound address; the local part is the tenant routing slug.
    to: String,
    from: String,
    subject: Option<String>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct VoicePayload {
    line: String,
    caller: String,
    transcript: String,
}

// ── Normalization ───────────────────────────────────────────────────

/// Decode a raw channel payload into an [`InboundMessage`].
pub fn normalize(channel: Channel, raw: &str) -> Result<InboundMessage, NormalizeError> {
    let malformed = |reason: String| NormalizeError::MalformedPayload { channel, reason };

    let message = match channel {
        Channel::Telegram => {
            let p: TelegramPayload =
                serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
            let attachments = p
                .message
                .photo
                .into_iter()
                .map(|ph| AttachmentRef {
                    id: ph.file_id,
                    kind: "photo".into(),
                })
                .collect::<Vec<_>>();
            let text = p.message.text.unwrap_or_default();
            if text.is_empty() && attachments.is_empty() {
                return Err(NormalizeError::MissingField {
                    channel,
                    field: "message.text".into(),
                });
            }
            InboundMessage {
                channel,
                external_user_id: p.message.from.id.to_string(),
                tenant_hint: TenantHint::BotId(p.bot_id),
                raw_text: text,
                received_at: Utc::now(),
                attachments,
            }
        }
        Channel::Whatsapp => {
            let p: WhatsappPayload =
                serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
            let attachments = p
                .media
                .into_iter()
                .map(|m| AttachmentRef {
                    id: m.id,
                    kind: if m.mime_type.is_empty() {
                        "media".into()
                    } else {
                        m.mime_type
                    },
                })
                .collect::<Vec<_>>();
            let text = p.body.unwrap_or_default();
            if text.is_empty() && attachments.is_empty() {
                return Err(NormalizeError::MissingField {
                    channel,
                    field: "body".into(),
                });
            }
            InboundMessage {
                channel,
                external_user_id: p.from,
                tenant_hint: TenantHint::PhoneNumber(p.to),
                raw_text: text,
                received_at: Utc::now(),
                attachments,
            }
        }
        Channel::Sms => {
            let p: SmsPayload = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
            if p.body.is_empty() {
                return Err(NormalizeError::MissingField {
                    channel,
                    field: "body".into(),
                });
            }
            InboundMessage {
                channel,
                external_user_id: p.from,
                tenant_hint: TenantHint::PhoneNumber(p.to),
                raw_text: p.body,
                received_at: Utc::now(),
                attachments: Vec::new(),
            }
        }
        Channel::Email => {
            let p: EmailPayload =
                serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
            let slug = p
                .to
                .split('@')
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| NormalizeError::MissingField {
                    channel,
                    field: "to".into(),
                })?
                .to_string();
            let raw_text = match p.subject {
                Some(ref subject) if !subject.is_empty() => {
                    format!("{}\n{}", subject, p.body)
                }
                _ => p.body,
            };
            InboundMessage {
                channel,
                external_user_id: p.from,
                tenant_hint: TenantHint::RouteSlug(slug),
                raw_text,
                received_at: Utc::now(),
                attachments: Vec::new(),
            }
        }
        Channel::Voice => {
            let p: VoicePayload =
                serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
            if p.transcript.is_empty() {
                return Err(NormalizeError::MissingField {
                    channel,
                    field: "transcript".into(),
                });
            }
            InboundMessage {
                channel,
                external_user_id: p.caller,
                tenant_hint: TenantHint::PhoneNumber(p.line),
                raw_text: p.transcript,
                received_at: Utc::now(),
                attachments: Vec::new(),
            }
        }
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_message_normalizes() {
        let raw = r#"{"bot_id": "bot-777", "message": {"from": {"id": 42}, "text": "Hi there"}}"#;
        let msg = normalize(Channel::Telegram, raw).unwrap();
        assert_eq!(msg.channel, Channel::Telegram);
        assert_eq!(msg.external_user_id, "42");
        assert_eq!(msg.tenant_hint, TenantHint::BotId("bot-777".into()));
        assert_eq!(msg.raw_text, "Hi there");
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn telegram_photo_without_text_is_accepted() {
        let raw = r#"{"bot_id": "bot-777", "message": {"from": {"id": 42}, "photo": [{"file_id": "ph-1"}]}}"#;
        let msg = normalize(Channel::Telegram, raw).unwrap();
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].kind, "photo");
    }

    #[test]
    fn telegram_empty_message_is_rejected() {
        let raw = r#"{"bot_id": "bot-777", "message": {"from": {"id": 42}}}"#;
        let err = normalize(Channel::Telegram, raw).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField { .. }));
    }

    #[test]
    fn whatsapp_routes_by_receiving_number() {
        let raw = r#"{"to": "+491700000001", "from": "+491519999999", "body": "Hallo"}"#;
        let msg = normalize(Channel::Whatsapp, raw).unwrap();
        assert_eq!(
            msg.tenant_hint,
            TenantHint::PhoneNumber("+491700000001".into())
        );
        assert_eq!(msg.external_user_id, "+491519999999");
    }

    #[test]
    fn sms_empty_body_is_rejected() {
        let raw = r#"{"to": "+4917000", "from": "+4915199", "body": ""}"#;
        assert!(matches!(
            normalize(Channel::Sms, raw),
            Err(NormalizeError::MissingField { .. })
        ));
    }

    #[test]
    fn email_extracts_route_slug_and_prefixes_subject() {
        let raw = r#"{"to": "nordgym@inbound.example.com", "from": "kunde@web.de", "subject": "Frage", "body": "Wann habt ihr offen?"}"#;
        let msg = normalize(Channel::Email, raw).unwrap();
        assert_eq!(msg.tenant_hint, TenantHint::RouteSlug("nordgym".into()));
        assert!(msg.raw_text.starts_with("Frage\n"));
    }

    #[test]
    fn voice_transcript_normalizes() {
        let raw =
            r#"{"line": "+4930111", "caller": "+4917688", "transcript": "Ich moechte kuendigen"}"#;
        let msg = normalize(Channel::Voice, raw).unwrap();
        assert_eq!(msg.channel, Channel::Voice);
        assert_eq!(msg.raw_text, "Ich moechte kuendigen");
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = normalize(Channel::Whatsapp, "not json at all").unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedPayload { .. }));
    }

    #[test]
    fn channel_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(Channel::Whatsapp).unwrap(),
            serde_json::json!("whatsapp")
        );
    }
}
