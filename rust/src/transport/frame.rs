use chrono::Utc;
use serde_json::Value;

use crate::error::WireError;
use crate::state::{ConversationId, UserId};
use crate::wire::{field, id_string, DeletionNotice, Envelope};

/// One inbound frame after normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Message(Envelope),
    Deleted(DeletionNotice),
    MarkedRead {
        conversation_id: ConversationId,
        viewer_id: Option<UserId>,
    },
    /// Anything we could not normalize. Never dropped.
    Opaque(String),
}

/// Best-effort parse. Frames may be flat or wrap their payload under `data`
/// (or an object-valued `message`); an optional `event` picks the kind.
pub fn parse_frame(raw: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Inbound::Opaque(raw.to_string());
    };
    match normalize(&value) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::debug!(error = %e, "frame not normalized; passing through");
            Inbound::Opaque(raw.to_string())
        }
    }
}

fn normalize(value: &Value) -> Result<Inbound, WireError> {
    let outer = value.as_object().ok_or(WireError::NotAnObject)?;
    let payload = match field(outer, &["data", "payload"]) {
        Some(inner) if inner.is_object() => inner,
        _ => match outer.get("message") {
            Some(inner) if inner.is_object() => inner,
            _ => value,
        },
    };
    let event = field(outer, &["event", "eventType"])
        .or_else(|| payload.as_object().and_then(|p| field(p, &["event", "eventType"])))
        .and_then(Value::as_str)
        .map(|e| e.trim().to_ascii_lowercase().replace('_', "-"));

    match event.as_deref() {
        None
        | Some("message" | "new-message" | "message-received" | "chat-message-received") => {
            Envelope::from_value(payload, Utc::now()).map(Inbound::Message)
        }
        Some("message-deleted" | "chat-message-deleted") => {
            DeletionNotice::from_value(payload).map(Inbound::Deleted)
        }
        Some("conversation-marked-read" | "conversation-read" | "mark-as-read") => {
            let obj = payload.as_object().ok_or(WireError::NotAnObject)?;
            let conversation_id = field(obj, &["conversationId", "chatId"])
                .and_then(id_string)
                .ok_or(WireError::MissingField("conversationId"))?;
            let viewer_id = field(obj, &["userId", "viewerId", "readerId"])
                .and_then(id_string)
                .map(UserId::new);
            Ok(Inbound::MarkedRead {
                conversation_id: ConversationId::new(conversation_id),
                viewer_id,
            })
        }
        Some(other) => Err(WireError::UnknownEvent(other.to_string())),
    }
}
