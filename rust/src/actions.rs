use crate::state::{ChatTarget, ContentKind, ConversationId, SurfaceId, UserId};

#[derive(Debug, Clone)]
pub enum AppAction {
    // Session
    StartSession {
        viewer_id: String,
        token: Option<String>,
    },
    EndSession,

    // Conversation list
    RefreshConversations,
    MarkRead {
        conversation_id: ConversationId,
    },
    CreateGroup {
        name: String,
        member_ids: Vec<UserId>,
    },

    // Full chat page
    OpenConversation {
        conversation_id: ConversationId,
    },
    CloseConversation,

    // Mini windows
    StartChat {
        user_id: UserId,
    },
    OpenMiniChat {
        conversation_id: ConversationId,
    },
    OpenAssistant,
    CloseMiniChat {
        target: ChatTarget,
    },
    SetMiniWindowMinimized {
        target: ChatTarget,
        minimized: bool,
    },

    // Any surface
    LoadOlderMessages {
        surface: SurfaceId,
    },
    RetryLoad {
        surface: SurfaceId,
    },
    SendMessage {
        surface: SurfaceId,
        text: String,
        kind: ContentKind,
        resource_urls: Vec<String>,
    },
    DeleteMessage {
        surface: SurfaceId,
        message_id: String,
    },
    DismissSendError {
        surface: SurfaceId,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes tokens or draft text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Session
            AppAction::StartSession { .. } => "StartSession",
            AppAction::EndSession => "EndSession",

            // Conversation list
            AppAction::RefreshConversations => "RefreshConversations",
            AppAction::MarkRead { .. } => "MarkRead",
            AppAction::CreateGroup { .. } => "CreateGroup",

            // Full chat page
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",

            // Mini windows
            AppAction::StartChat { .. } => "StartChat",
            AppAction::OpenMiniChat { .. } => "OpenMiniChat",
            AppAction::OpenAssistant => "OpenAssistant",
            AppAction::CloseMiniChat { .. } => "CloseMiniChat",
            AppAction::SetMiniWindowMinimized { .. } => "SetMiniWindowMinimized",

            // Any surface
            AppAction::LoadOlderMessages { .. } => "LoadOlderMessages",
            AppAction::RetryLoad { .. } => "RetryLoad",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::DeleteMessage { .. } => "DeleteMessage",
            AppAction::DismissSendError { .. } => "DismissSendError",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_never_leaks_payloads() {
        let action = AppAction::StartSession {
            viewer_id: "u1".into(),
            token: Some("secret-token".into()),
        };
        assert_eq!(action.tag(), "StartSession");
        let action = AppAction::SendMessage {
            surface: SurfaceId::ChatPage,
            text: "private words".into(),
            kind: ContentKind::Text,
            resource_urls: vec![],
        };
        assert!(!action.tag().contains("private"));
    }
}
