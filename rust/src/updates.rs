use crate::directory::RefreshTicket;
use crate::error::ApiError;
use crate::reconciler::LoadTicket;
use crate::state::{AppState, Conversation, ConversationId, Message, SurfaceId};
use crate::transport::TransportEvent;
use crate::wire::MessagePage;
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    /// A failed send handed its text back to the surface's composer.
    DraftRestored {
        rev: u64,
        surface: SurfaceId,
        text: String,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::DraftRestored { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
    Shutdown,
}

/// Results of work done off the actor thread. Every variant carries the
/// session epoch it was started under; results from an ended session are
/// dropped.
#[derive(Debug)]
pub enum InternalEvent {
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    ConversationsLoaded {
        epoch: u64,
        ticket: RefreshTicket,
        result: Result<Vec<Conversation>, ApiError>,
    },
    HistoryLoaded {
        epoch: u64,
        surface: SurfaceId,
        ticket: LoadTicket,
        result: Result<MessagePage, ApiError>,
    },
    SendCompleted {
        epoch: u64,
        surface: SurfaceId,
        local_id: String,
        /// The conversation the send was addressed to, possibly temporary.
        conversation_id: Option<ConversationId>,
        result: Result<Message, ApiError>,
    },
    AssistantReplied {
        epoch: u64,
        surface: SurfaceId,
        result: Result<String, ApiError>,
    },
    MarkedRead {
        epoch: u64,
        conversation_id: ConversationId,
        result: Result<(), ApiError>,
    },
    DeleteCompleted {
        epoch: u64,
        surface: SurfaceId,
        conversation_id: ConversationId,
        message_id: String,
        is_latest: bool,
        result: Result<(), ApiError>,
    },
    GroupCreated {
        epoch: u64,
        result: Result<Conversation, ApiError>,
    },
    /// Something outside the core published a window request on the bus.
    BusWake,

    // Test hooks
    InjectedFrame {
        raw: String,
    },
}
