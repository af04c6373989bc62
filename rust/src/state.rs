use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::windows::WindowPosition;

/// Marker carried by conversation ids minted locally before the server has
/// assigned a real one.
pub const TEMP_CONVERSATION_PREFIX: &str = "temp-";
pub const LOCAL_MESSAGE_PREFIX: &str = "local-";
pub const DELETED_PREVIEW: &str = "Message deleted";
pub const ASSISTANT_AUTHOR: &str = "assistant";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn temporary() -> Self {
        Self(format!("{TEMP_CONVERSATION_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_CONVERSATION_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A message is addressed by a transient local id until the server assigns
/// the real one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(String),
    Server(String),
}

impl MessageId {
    pub fn local() -> Self {
        Self::Local(format!("{LOCAL_MESSAGE_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local(id) | Self::Server(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    Video,
    File,
    Deleted,
}

impl ContentKind {
    /// Unknown kinds degrade to `Text` so a newer server never hides a message.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "images" => Self::Image,
            "video" | "videos" => Self::Video,
            "file" | "files" | "audio" => Self::File,
            "deleted" => Self::Deleted,
            _ => Self::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub text: String,
    pub resource_urls: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub body: MessageBody,
    pub kind: ContentKind,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn server_id(&self) -> Option<&str> {
        match &self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Local(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == ContentKind::Deleted
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }

    /// One-line text for list previews.
    pub fn preview_text(&self) -> String {
        match self.kind {
            ContentKind::Deleted => DELETED_PREVIEW.to_string(),
            _ if !self.body.text.trim().is_empty() => self.body.text.clone(),
            ContentKind::Image => "[Image]".to_string(),
            ContentKind::Video => "[Video]".to_string(),
            ContentKind::File => "[File]".to_string(),
            ContentKind::Text => String::new(),
        }
    }
}

/// The assistant is a distinct variant rather than a reserved id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Private,
    Group { group_id: String },
    Assistant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessagePreview {
    pub text: String,
    pub at: DateTime<Utc>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participant_ids: BTreeSet<UserId>,
    pub title: Option<String>,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn group_id(&self) -> Option<&str> {
        match &self.kind {
            ConversationKind::Group { group_id } => Some(group_id),
            _ => None,
        }
    }

    pub fn is_private_with(&self, user_id: &UserId) -> bool {
        self.kind == ConversationKind::Private && self.participant_ids.contains(user_id)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|p| p.at)
    }

    /// Title to show for `viewer`: explicit title, else the other participants.
    pub fn display_title(&self, viewer: &UserId) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let others: Vec<&str> = self
            .participant_ids
            .iter()
            .filter(|p| *p != viewer)
            .map(UserId::as_str)
            .collect();
        if others.is_empty() {
            viewer.to_string()
        } else {
            others.join(", ")
        }
    }
}

/// What a chat surface shows: a real conversation or the assistant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChatTarget {
    Conversation(ConversationId),
    Assistant,
}

impl ChatTarget {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Conversation(id) => Some(id),
            Self::Assistant => None,
        }
    }

    pub fn renamed(&self, temp_id: &ConversationId, conversation_id: &ConversationId) -> Self {
        match self {
            Self::Conversation(id) if id == temp_id => Self::Conversation(conversation_id.clone()),
            other => other.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceId {
    ChatPage,
    MiniWindow(ChatTarget),
}

impl SurfaceId {
    pub fn renamed(&self, temp_id: &ConversationId, conversation_id: &ConversationId) -> Self {
        match self {
            Self::ChatPage => Self::ChatPage,
            Self::MiniWindow(target) => {
                Self::MiniWindow(target.renamed(temp_id, conversation_id))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready,
    Failed { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    CircuitOpen,
}

#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub viewer_id: Option<UserId>,
    pub connection: ConnectionStatus,
    pub conversations: Vec<Conversation>,
    pub conversations_status: LoadStatus,
    pub total_unread: u32,
    pub current_chat: Option<ChatViewState>,
    pub mini_windows: Vec<MiniWindowState>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            viewer_id: None,
            connection: ConnectionStatus::Offline,
            conversations: vec![],
            conversations_status: LoadStatus::Idle,
            total_unread: 0,
            current_chat: None,
            mini_windows: vec![],
            toast: None,
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn mini_window(&self, target: &ChatTarget) -> Option<&MiniWindowState> {
        self.mini_windows.iter().find(|w| &w.target == target)
    }
}

#[derive(Clone, Debug)]
pub struct ChatViewState {
    pub surface: SurfaceId,
    pub target: ChatTarget,
    pub title: String,
    pub messages: Vec<Message>,
    pub can_load_older: bool,
    pub load_status: LoadStatus,
    pub send_error: Option<String>,
    /// Draft text handed back after a failed send.
    pub restored_draft: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MiniWindowState {
    pub target: ChatTarget,
    pub minimized: bool,
    pub position: WindowPosition,
    pub view: Option<ChatViewState>,
}
