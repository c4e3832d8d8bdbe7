//! Webhook Decoder: classifies an inbound chat-platform update
//! into one of the outcomes the router needs, after a big-integer-safe
//! parse. IDs are read out as strings regardless of whether the wire
//! encoded them as JSON numbers or strings — the snapshot integrity gate
//! (`assert_id_is_string`) makes the `UNSAFE_TELEGRAM_ID` invariant
//! syntactically impossible to skip.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::dialog::IncomingMessage;
use crate::ports::messaging::Chat;
use crate::ports::storage::UserProfile;

use super::bigint::quote_big_integers;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("UNSAFE_TELEGRAM_ID: {0}")]
    UnsafeId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTextKind {
    Voice,
    Media,
}

impl NonTextKind {
    pub fn reply_text(self) -> &'static str {
        match self {
            NonTextKind::Voice => "🔇 👉📝",
            NonTextKind::Media => "🖼️❌ 👉📝",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRoute {
    /// Ordinary conversational turn, destined for the Dialog Engine.
    Default,
    /// Text starting with `/`; destined for the Admin Command Gate.
    Command(String),
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// The router should do nothing further (duplicate update, update kind
    /// we don't act on); `None` means send no response at all.
    Handled(Option<String>),
    Message {
        incoming: IncomingMessage,
        route: MessageRoute,
    },
    NonText {
        chat: Chat,
        kind: NonTextKind,
    },
}

/// Parses `raw_body` (as received from the platform) into a `WebhookOutcome`.
pub fn decode(raw_body: &str) -> Result<WebhookOutcome, DecodeError> {
    let safe_body = quote_big_integers(raw_body);
    let update: Value = serde_json::from_str(&safe_body).map_err(|_| DecodeError::InvalidJson)?;

    assert_id_is_string(&update, "update_id")?;
    let update_id = id_to_string(update.get("update_id"))?;

    let Some(message) = update.get("message") else {
        return Ok(WebhookOutcome::Handled(None));
    };

    let chat_value = message
        .get("chat")
        .ok_or_else(|| DecodeError::UnsafeId("missing chat".into()))?;
    assert_id_is_string(chat_value, "id")?;
    let chat_id = id_to_string(chat_value.get("id"))?
        .ok_or_else(|| DecodeError::UnsafeId("chat.id missing".into()))?;
    let thread_id = id_to_string(message.get("message_thread_id"))?;
    let chat = Chat {
        id: chat_id,
        thread_id,
    };

    if let Some(text) = message.get("text").and_then(Value::as_str) {
        let from = message.get("from");
        let user_id = id_to_string(from.and_then(|f| f.get("id")))?
            .ok_or_else(|| DecodeError::UnsafeId("from.id missing".into()))?;
        let message_id = id_to_string(message.get("message_id"))?;

        let user = UserProfile {
            user_id,
            username: from
                .and_then(|f| f.get("username"))
                .and_then(Value::as_str)
                .map(str::to_string),
            first_name: from
                .and_then(|f| f.get("first_name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            last_name: from
                .and_then(|f| f.get("last_name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            language_code: from
                .and_then(|f| f.get("language_code"))
                .and_then(Value::as_str)
                .map(str::to_string),
            utm_source: None,
            metadata: None,
        };

        let incoming = IncomingMessage {
            user,
            chat,
            text: text.to_string(),
            message_id,
            update_id,
            received_at: Utc::now(),
        };

        let route = if text.starts_with('/') {
            let command = text
                .split_whitespace()
                .next()
                .unwrap_or(text)
                .trim_start_matches('/')
                .split('@')
                .next()
                .unwrap_or("")
                .to_string();
            MessageRoute::Command(command)
        } else {
            MessageRoute::Default
        };

        return Ok(WebhookOutcome::Message { incoming, route });
    }

    if message.get("voice").is_some() {
        return Ok(WebhookOutcome::NonText {
            chat,
            kind: NonTextKind::Voice,
        });
    }

    if message.get("photo").is_some()
        || message.get("document").is_some()
        || message.get("video").is_some()
        || message.get("sticker").is_some()
    {
        return Ok(WebhookOutcome::NonText {
            chat,
            kind: NonTextKind::Media,
        });
    }

    Ok(WebhookOutcome::Handled(None))
}

/// Reads an id-like field as a string regardless of whether the JSON
/// encoded it as a (possibly big-int-quoted) string or a small number.
fn id_to_string(value: Option<&Value>) -> Result<Option<String>, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(DecodeError::UnsafeId(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Snapshot integrity gate: `field` on `container`, if present, must be a
/// JSON string or number — never an object/array/bool, which would
/// indicate the update shape drifted from what the big-int preprocessor
/// and decoder assume.
fn assert_id_is_string(container: &Value, field: &str) -> Result<(), DecodeError> {
    match container.get(field) {
        None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_)) => Ok(()),
        Some(other) => Err(DecodeError::UnsafeId(format!(
            "{field} has unexpected shape: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_plain_text_message() {
        let body = r#"{
            "update_id": 1,
            "message": {
                "message_id": 42,
                "chat": {"id": "c1"},
                "from": {"id": "u1", "username": "alice"},
                "text": "hello"
            }
        }"#;
        match decode(body).unwrap() {
            WebhookOutcome::Message { incoming, route } => {
                assert_eq!(incoming.text, "hello");
                assert_eq!(incoming.user.user_id, "u1");
                assert_eq!(incoming.update_id, Some("1".to_string()));
                assert_eq!(route, MessageRoute::Default);
            }
            other => panic!("expected Message outcome, got {other:?}"),
        }
    }

    #[test]
    fn classifies_slash_commands() {
        let body = r#"{
            "update_id": 1,
            "message": {
                "message_id": 42,
                "chat": {"id": "c1"},
                "from": {"id": "u1"},
                "text": "/export@mybot 2024-01-01"
            }
        }"#;
        match decode(body).unwrap() {
            WebhookOutcome::Message { route, .. } => {
                assert_eq!(route, MessageRoute::Command("export".to_string()));
            }
            other => panic!("expected Message outcome, got {other:?}"),
        }
    }

    #[test]
    fn classifies_voice_and_media() {
        let voice = r#"{"update_id":1,"message":{"chat":{"id":"c1"},"voice":{}}}"#;
        assert!(matches!(
            decode(voice).unwrap(),
            WebhookOutcome::NonText {
                kind: NonTextKind::Voice,
                ..
            }
        ));

        let media = r#"{"update_id":1,"message":{"chat":{"id":"c1"},"photo":[]}}"#;
        assert!(matches!(
            decode(media).unwrap(),
            WebhookOutcome::NonText {
                kind: NonTextKind::Media,
                ..
            }
        ));
    }

    #[test]
    fn ignores_updates_without_a_message_field() {
        let body = r#"{"update_id":1,"edited_message":{}}"#;
        assert!(matches!(decode(body).unwrap(), WebhookOutcome::Handled(None)));
    }

    #[test]
    fn preserves_large_chat_ids_as_strings_through_decode() {
        let body = r#"{
            "update_id": 1,
            "message": {
                "message_id": 9223372036854775807,
                "chat": {"id": -1002003004005006007},
                "from": {"id": "u1"},
                "message_thread_id": 9223372036854775807,
                "text": "hi"
            }
        }"#;
        match decode(body).unwrap() {
            WebhookOutcome::Message { incoming, .. } => {
                assert_eq!(incoming.chat.id, "-1002003004005006007");
                assert_eq!(
                    incoming.chat.thread_id,
                    Some("9223372036854775807".to_string())
                );
                assert_eq!(incoming.message_id, Some("9223372036854775807".to_string()));
            }
            other => panic!("expected Message outcome, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_scalar_ids_as_unsafe() {
        let body = r#"{"update_id":1,"message":{"chat":{"id":{"nested":true}},"text":"hi"}}"#;
        assert!(matches!(decode(body), Err(DecodeError::UnsafeId(_))));
    }
}
