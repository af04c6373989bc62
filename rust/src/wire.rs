//! Normalization of service payloads into canonical records.
//!
//! The service is inconsistent about field names (`chatId` vs
//! `conversationId`, `senderId` vs `fromUserId`, `sentAt` vs `createdAt`) and
//! about id/timestamp encodings. Every alias is resolved here so nothing
//! downstream ever looks at raw JSON.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::WireError;
use crate::state::{
    ContentKind, Conversation, ConversationId, ConversationKind, DeliveryState, Message,
    MessageBody, MessageId, MessagePreview, UserId,
};

const ID_KEYS: &[&str] = &["id", "_id", "messageId"];
const CONVERSATION_KEYS: &[&str] = &["conversationId", "chatId"];
const SENDER_KEYS: &[&str] = &["fromUserId", "senderId"];
const TEXT_KEYS: &[&str] = &["message", "content", "text"];
const KIND_KEYS: &[&str] = &["type", "messageType"];
const RESOURCE_KEYS: &[&str] = &["resourceUrls", "resources"];
const CREATED_KEYS: &[&str] = &["createdAt", "sentAt"];

// Epoch numbers below this are seconds, above are milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Canonical form of one transport-delivered (or fetched) message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: Option<String>,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub message: String,
    pub kind: ContentKind,
    pub resource_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// `received_at` stands in for a missing server timestamp.
    pub fn from_value(value: &Value, received_at: DateTime<Utc>) -> Result<Self, WireError> {
        let obj = value.as_object().ok_or(WireError::NotAnObject)?;
        let conversation_id = field(obj, CONVERSATION_KEYS)
            .and_then(id_string)
            .ok_or(WireError::MissingField("conversationId"))?;
        let from_user_id = field(obj, SENDER_KEYS)
            .and_then(user_ref)
            .ok_or(WireError::MissingField("fromUserId"))?;
        let message = field(obj, TEXT_KEYS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let deleted = obj
            .get("isDeleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let kind = if deleted {
            ContentKind::Deleted
        } else {
            field(obj, KIND_KEYS)
                .and_then(Value::as_str)
                .map(ContentKind::parse)
                .unwrap_or_default()
        };
        let resource_urls = if kind == ContentKind::Deleted {
            vec![]
        } else {
            field(obj, RESOURCE_KEYS)
                .and_then(Value::as_array)
                .map(|urls| {
                    urls.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let created_at = field(obj, CREATED_KEYS)
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Self {
            id: field(obj, ID_KEYS).and_then(id_string),
            conversation_id: ConversationId::new(conversation_id),
            from_user_id,
            message,
            kind,
            resource_urls,
            created_at,
        })
    }

    pub fn into_message(self) -> Message {
        let id = match self.id {
            Some(id) => MessageId::Server(id),
            None => MessageId::local(),
        };
        Message {
            id,
            conversation_id: self.conversation_id,
            from_user_id: self.from_user_id,
            body: MessageBody {
                text: if self.kind == ContentKind::Deleted {
                    String::new()
                } else {
                    self.message
                },
                resource_urls: self.resource_urls,
            },
            kind: self.kind,
            created_at: self.created_at,
            delivery: DeliveryState::Sent,
        }
    }
}

/// Decode a fetched message; unlike transport frames, it must carry an id.
pub fn message_from_value(value: &Value) -> Result<Message, WireError> {
    let envelope = Envelope::from_value(value, Utc::now())?;
    if envelope.id.is_none() {
        return Err(WireError::MissingField("id"));
    }
    Ok(envelope.into_message())
}

/// A deletion announced by the server or by another local surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletionNotice {
    pub conversation_id: ConversationId,
    pub message_id: String,
    /// True only when the deleted message is the conversation's most recent.
    pub is_latest: bool,
}

impl DeletionNotice {
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let obj = value.as_object().ok_or(WireError::NotAnObject)?;
        let conversation_id = field(obj, CONVERSATION_KEYS)
            .and_then(id_string)
            .ok_or(WireError::MissingField("conversationId"))?;
        let message_id = field(obj, ID_KEYS)
            .and_then(id_string)
            .ok_or(WireError::MissingField("messageId"))?;
        let is_latest = field(obj, &["isLatest", "isLastMessage"])
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            conversation_id: ConversationId::new(conversation_id),
            message_id,
            is_latest,
        })
    }
}

pub fn conversation_from_value(value: &Value) -> Result<Conversation, WireError> {
    let obj = value.as_object().ok_or(WireError::NotAnObject)?;
    let id = field(obj, &["id", "_id", "conversationId", "chatId"])
        .and_then(id_string)
        .ok_or(WireError::MissingField("id"))?;

    let group_id = field(obj, &["groupId", "group"]).and_then(|g| match g {
        Value::Object(group) => field(group, &["id", "_id"]).and_then(id_string),
        other => id_string(other),
    });
    let declared = field(obj, &["type", "kind", "conversationType"])
        .and_then(Value::as_str)
        .map(|k| k.to_ascii_lowercase());
    let kind = match (declared.as_deref(), group_id) {
        (Some("assistant"), _) => ConversationKind::Assistant,
        (_, Some(group_id)) => ConversationKind::Group { group_id },
        _ => ConversationKind::Private,
    };

    let participant_ids: BTreeSet<UserId> = field(obj, &["participantIds", "participants"])
        .and_then(Value::as_array)
        .map(|ps| ps.iter().filter_map(user_ref).collect())
        .unwrap_or_default();

    let title = field(obj, &["name", "title", "groupName"])
        .and_then(Value::as_str)
        .map(str::to_string);

    let last_message = match field(obj, &["lastMessage"]) {
        Some(Value::Object(last)) => preview_from_object(last),
        _ => {
            let text = field(obj, &["lastMessageText", "lastMessagePreview"])
                .and_then(Value::as_str);
            let at = field(obj, &["lastMessageAt", "updatedAt"]).and_then(parse_timestamp);
            match (text, at) {
                (Some(text), Some(at)) => Some(MessagePreview {
                    text: text.to_string(),
                    at,
                    message_id: None,
                }),
                _ => None,
            }
        }
    };

    let unread_count = field(obj, &["unreadCount", "unread"])
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0);

    Ok(Conversation {
        id: ConversationId::new(id),
        kind,
        participant_ids,
        title,
        last_message,
        unread_count,
    })
}

fn preview_from_object(last: &Map<String, Value>) -> Option<MessagePreview> {
    let at = field(last, CREATED_KEYS).and_then(parse_timestamp)?;
    let deleted = last
        .get("isDeleted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || field(last, KIND_KEYS).and_then(Value::as_str) == Some("deleted");
    let text = if deleted {
        crate::state::DELETED_PREVIEW.to_string()
    } else {
        field(last, TEXT_KEYS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(MessagePreview {
        text,
        at,
        message_id: field(last, ID_KEYS).and_then(id_string),
    })
}

/// One page of history, newest first as the service returns it.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

pub fn page_from_value(value: &Value, page: u32, limit: u32) -> Result<MessagePage, WireError> {
    let (items, obj) = match value {
        Value::Array(items) => (items, None),
        Value::Object(obj) => {
            let items = field(obj, &["messages", "items", "data"])
                .and_then(Value::as_array)
                .ok_or(WireError::MissingField("messages"))?;
            (items, Some(obj))
        }
        _ => return Err(WireError::NotAnObject),
    };
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        match message_from_value(item) {
            Ok(message) => messages.push(message),
            // A bad record must not take its siblings down with it.
            Err(e) => tracing::warn!(error = %e, "skipping undecodable message"),
        }
    }
    let page = obj
        .and_then(|o| o.get("page"))
        .and_then(Value::as_u64)
        .map(|p| p as u32)
        .unwrap_or(page);
    let limit = obj
        .and_then(|o| o.get("limit"))
        .and_then(Value::as_u64)
        .map(|l| l as u32)
        .unwrap_or(limit);
    let has_more = obj
        .and_then(|o| field(o, &["hasMore", "hasNextPage"]))
        .and_then(Value::as_bool)
        .unwrap_or(limit > 0 && items.len() as u32 >= limit);
    Ok(MessagePage {
        messages,
        page,
        limit,
        has_more,
    })
}

/// RFC 3339 strings, naive ISO strings (taken as UTC), or epoch numbers.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(epoch_to_datetime)
        }
        Value::Number(n) => n.as_i64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() < EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_opt(n, 0).single()
    } else {
        Utc.timestamp_millis_opt(n).single()
    }
}

pub(crate) fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A user may be referenced by bare id or by an embedded profile object.
fn user_ref(value: &Value) -> Option<UserId> {
    match value {
        Value::Object(user) => field(user, &["id", "_id", "userId"]).and_then(id_string),
        other => id_string(other),
    }
    .map(UserId::new)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_accepts_alias_field_names() {
        let raw = json!({
            "_id": 42,
            "chatId": "c1",
            "senderId": "B",
            "message": "hi",
            "sentAt": "2024-05-01T10:00:00Z",
        });
        let env = Envelope::from_value(&raw, Utc::now()).unwrap();
        assert_eq!(env.id.as_deref(), Some("42"));
        assert_eq!(env.conversation_id, ConversationId::new("c1"));
        assert_eq!(env.from_user_id, UserId::new("B"));
        assert_eq!(env.kind, ContentKind::Text);
        assert_eq!(env.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn canonical_names_win_over_aliases() {
        let raw = json!({
            "conversationId": "c1",
            "chatId": "stale",
            "fromUserId": { "_id": "u7", "name": "Ana" },
            "message": "",
            "type": "image",
            "resourceUrls": ["https://cdn/a.png"],
        });
        let received = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let env = Envelope::from_value(&raw, received).unwrap();
        assert_eq!(env.conversation_id.as_str(), "c1");
        assert_eq!(env.from_user_id.as_str(), "u7");
        assert_eq!(env.kind, ContentKind::Image);
        assert_eq!(env.resource_urls, vec!["https://cdn/a.png".to_string()]);
        assert_eq!(env.created_at, received);
    }

    #[test]
    fn deleted_flag_clears_resources() {
        let raw = json!({
            "id": "m1",
            "conversationId": "c1",
            "senderId": "B",
            "message": "secret",
            "type": "image",
            "resourceUrls": ["https://cdn/a.png"],
            "isDeleted": true,
        });
        let msg = message_from_value(&raw).unwrap();
        assert!(msg.is_deleted());
        assert!(msg.body.resource_urls.is_empty());
        assert!(msg.body.text.is_empty());
    }

    #[test]
    fn missing_sender_is_rejected() {
        let raw = json!({ "chatId": "c1", "message": "hi" });
        assert_eq!(
            Envelope::from_value(&raw, Utc::now()),
            Err(WireError::MissingField("fromUserId"))
        );
    }

    #[test]
    fn timestamps_in_seconds_and_millis() {
        let secs = parse_timestamp(&json!(1_700_000_000)).unwrap();
        let millis = parse_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(secs, millis);
        let naive = parse_timestamp(&json!("2024-05-01T10:00:00.250")).unwrap();
        assert_eq!(naive.timestamp_millis() % 1000, 250);
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn conversation_decodes_group_and_preview() {
        let raw = json!({
            "_id": "c2",
            "group": { "_id": "g1", "name": "Hikers" },
            "name": "Hikers",
            "participants": [{ "_id": "a" }, "b"],
            "lastMessage": { "_id": "m9", "content": "see you", "createdAt": 1_700_000_000 },
            "unreadCount": 3,
        });
        let conv = conversation_from_value(&raw).unwrap();
        assert_eq!(conv.group_id(), Some("g1"));
        assert_eq!(conv.participant_ids.len(), 2);
        assert_eq!(conv.unread_count, 3);
        let preview = conv.last_message.unwrap();
        assert_eq!(preview.text, "see you");
        assert_eq!(preview.message_id.as_deref(), Some("m9"));
    }

    #[test]
    fn page_skips_undecodable_messages() {
        let raw = json!({
            "messages": [
                { "id": "m3", "conversationId": "c1", "senderId": "a", "message": "3", "createdAt": 3 },
                { "id": "m2", "message": "no conversation or sender" },
                "garbage",
                { "id": "m1", "conversationId": "c1", "senderId": "a", "message": "1", "createdAt": 1 },
            ]
        });
        let page = page_from_value(&raw, 1, 4).unwrap();
        let ids: Vec<String> = page.messages.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
        // Paging follows the raw record count, skipped ones included.
        assert!(page.has_more);
    }

    #[test]
    fn page_defaults_has_more_from_length() {
        let raw = json!({
            "messages": [
                { "id": "m2", "conversationId": "c1", "senderId": "a", "message": "2", "createdAt": 2 },
                { "id": "m1", "conversationId": "c1", "senderId": "a", "message": "1", "createdAt": 1 },
            ]
        });
        let page = page_from_value(&raw, 0, 2).unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.has_more);
        let page = page_from_value(&raw, 0, 30).unwrap();
        assert!(!page.has_more);
    }
}
