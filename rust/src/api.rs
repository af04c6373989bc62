//! The remote chat service, as a trait the core can be driven against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::{ContentKind, Conversation, ConversationId, Message, UserId};
use crate::wire::{conversation_from_value, message_from_value, page_from_value, MessagePage};

/// Who a send is addressed to. The first message to a user has no
/// conversation yet; the server creates one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendDestination {
    Conversation(ConversationId),
    User(UserId),
    Group(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_urls: Vec<String>,
}

impl SendRequest {
    pub fn new(
        destination: SendDestination,
        message: String,
        kind: ContentKind,
        resource_urls: Vec<String>,
    ) -> Self {
        let mut req = Self {
            conversation_id: None,
            receiver_id: None,
            group_id: None,
            message,
            kind,
            resource_urls,
        };
        match destination {
            SendDestination::Conversation(id) => req.conversation_id = Some(id),
            SendDestination::User(id) => req.receiver_id = Some(id),
            SendDestination::Group(id) => req.group_id = Some(id),
        }
        req
    }
}

#[async_trait]
pub trait ChatService: Send + Sync + 'static {
    async fn send_message(&self, request: SendRequest) -> Result<Message, ApiError>;

    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    /// Newest first, as the service stores them.
    async fn messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, ApiError>;

    async fn mark_as_read(&self, conversation_id: &ConversationId) -> Result<(), ApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError>;

    async fn create_group(&self, name: &str, member_ids: &[UserId])
        -> Result<Conversation, ApiError>;
}

pub type SharedChatService = Arc<dyn ChatService>;

/// Stateless request/response collaborator behind the assistant window.
#[async_trait]
pub trait AssistantBridge: Send + Sync + 'static {
    async fn reply(&self, history: &[Message], prompt: &str) -> Result<String, ApiError>;
}

pub struct UnavailableAssistant;

#[async_trait]
impl AssistantBridge for UnavailableAssistant {
    async fn reply(&self, _history: &[Message], _prompt: &str) -> Result<String, ApiError> {
        Err(ApiError::Unavailable(
            "The assistant is not available right now".to_string(),
        ))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest<'a> {
    name: &'a str,
    member_ids: &'a [UserId],
}

#[derive(Clone)]
pub struct HttpChatService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatService {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn execute_json(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let resp = self.execute(req).await?;
        Ok(resp.json::<Value>().await?)
    }
}

/// Responses are either bare or wrapped as `{ "data": ... }`.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.get("data").is_some_and(Value::is_object) => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn unwrap_record(value: Value, key: &str) -> Value {
    match unwrap_data(value) {
        Value::Object(mut obj) if obj.get(key).is_some_and(Value::is_object) => {
            obj.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn conversation_list(value: &Value) -> Result<Vec<Conversation>, ApiError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => ["conversations", "data", "items"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .ok_or_else(|| ApiError::Decode("missing conversation list".to_string()))?,
        _ => return Err(ApiError::Decode("expected a conversation list".to_string())),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match conversation_from_value(item) {
            Ok(conv) => out.push(conv),
            // One malformed record should not hide the rest of the list.
            Err(e) => tracing::warn!(error = %e, "skipping undecodable conversation"),
        }
    }
    Ok(out)
}

#[async_trait]
impl ChatService for HttpChatService {
    async fn send_message(&self, request: SendRequest) -> Result<Message, ApiError> {
        let req = self.client.post(self.url("/chat/send")).json(&request);
        let value = unwrap_record(self.execute_json(req).await?, "message");
        Ok(message_from_value(&value)?)
    }

    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let req = self.client.get(self.url("/chat/conversations"));
        let value = self.execute_json(req).await?;
        conversation_list(&value)
    }

    async fn messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, ApiError> {
        let req = self.client.get(self.url("/chat/messages")).query(&[
            ("conversationId", conversation_id.as_str().to_string()),
            ("page", page.to_string()),
            ("limit", limit.to_string()),
        ]);
        let value = unwrap_data(self.execute_json(req).await?);
        Ok(page_from_value(&value, page, limit)?)
    }

    async fn mark_as_read(&self, conversation_id: &ConversationId) -> Result<(), ApiError> {
        let path = format!("/chat/conversations/{conversation_id}/mark-as-read");
        self.execute(self.client.post(self.url(&path))).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        let path = format!("/chat/messages/{message_id}");
        self.execute(self.client.delete(self.url(&path))).await?;
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<Conversation, ApiError> {
        let body = CreateGroupRequest { name, member_ids };
        let req = self.client.post(self.url("/chat/groups")).json(&body);
        let value = unwrap_record(self.execute_json(req).await?, "conversation");
        Ok(conversation_from_value(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn send_request_names_exactly_one_destination() {
        let req = SendRequest::new(
            SendDestination::User(UserId::new("u2")),
            "hello".into(),
            ContentKind::Text,
            vec![],
        );
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({ "receiverId": "u2", "message": "hello", "type": "text" })
        );

        let req = SendRequest::new(
            SendDestination::Conversation(ConversationId::new("c1")),
            String::new(),
            ContentKind::Image,
            vec!["https://cdn/a.png".into()],
        );
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "conversationId": "c1",
                "message": "",
                "type": "image",
                "resourceUrls": ["https://cdn/a.png"],
            })
        );
    }

    #[test]
    fn wrapped_records_are_unwrapped() {
        let raw = json!({ "data": { "message": { "id": "m1", "chatId": "c1", "senderId": "a", "message": "x" } } });
        let value = unwrap_record(raw, "message");
        assert_eq!(value["id"], "m1");

        // A message whose text lives under `message` is left alone.
        let raw = json!({ "id": "m2", "chatId": "c1", "senderId": "a", "message": "x" });
        assert_eq!(unwrap_record(raw.clone(), "message"), raw);
    }

    #[test]
    fn conversation_list_skips_bad_records() {
        let raw = json!({ "data": [{ "_id": "c1" }, "garbage", { "id": "c2" }] });
        let list = conversation_list(&raw).unwrap();
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn unavailable_assistant_reports_an_error() {
        let err = UnavailableAssistant.reply(&[], "hi").await.unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }
}
