//! One deduplicated, time-ordered message sequence per open surface.
//!
//! Three sources feed it: history pages fetched from the service, optimistic
//! local sends, and messages delivered by the transport (including echoes of
//! the viewer's own sends). The server never round-trips the local id of an
//! optimistic send, so echoes are matched by sender, content and a time
//! window.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::api::ChatService;
use crate::bus::{ChatEvent, EventBus, Mailbox, Topic};
use crate::error::ApiError;
use crate::state::{
    ChatTarget, ContentKind, ConversationId, DeliveryState, LoadStatus, Message, MessageBody,
    MessageId, SurfaceId, UserId, ASSISTANT_AUTHOR,
};
use crate::wire::{Envelope, MessagePage};

/// History pages are numbered from one.
pub const FIRST_PAGE: u32 = 1;

/// What the user typed, kept so a failed send can hand it back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub kind: ContentKind,
    pub resource_urls: Vec<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ContentKind::Text,
            resource_urls: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.resource_urls.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An entry with the same server id existed and was updated in place.
    Merged,
    /// The viewer's own send came back; the pending entry was promoted.
    Echo,
    Appended,
    Ignored,
}

/// Identifies one outstanding history fetch. Results carrying any other
/// ticket are stale. Unique across reconcilers, so a remounted surface never
/// accepts its predecessor's page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadTicket(u64);

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
struct Entry {
    message: Message,
    /// Arrival order, the tie-break for equal timestamps.
    seq: u64,
    /// Set for optimistic sends and kept after confirmation so a late
    /// confirmation still finds its row.
    local_id: Option<String>,
}

pub struct MessageReconciler {
    surface: SurfaceId,
    target: ChatTarget,
    viewer: UserId,
    dedup_window: chrono::Duration,
    page_size: u32,
    entries: Vec<Entry>,
    next_seq: u64,
    next_page: u32,
    can_load_older: bool,
    status: LoadStatus,
    in_flight: Option<(LoadTicket, u32)>,
    last_requested_page: Option<u32>,
    mailbox: Option<Mailbox>,
}

impl MessageReconciler {
    pub fn new(
        surface: SurfaceId,
        target: ChatTarget,
        viewer: UserId,
        dedup_window: std::time::Duration,
        page_size: u32,
    ) -> Self {
        Self {
            surface,
            target,
            viewer,
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            page_size: page_size.max(1),
            entries: Vec::new(),
            next_seq: 0,
            next_page: FIRST_PAGE,
            can_load_older: false,
            status: LoadStatus::Idle,
            in_flight: None,
            last_requested_page: None,
            mailbox: None,
        }
    }

    /// A reconciler that follows the bus. Unmounting is dropping it.
    pub fn mount(
        bus: &EventBus,
        surface: SurfaceId,
        target: ChatTarget,
        viewer: UserId,
        dedup_window: std::time::Duration,
        page_size: u32,
    ) -> Self {
        let mut reconciler = Self::new(surface, target, viewer, dedup_window, page_size);
        reconciler.mailbox = Some(bus.mailbox(&[
            Topic::MessageReceived,
            Topic::MessageSent,
            Topic::MessageDeleted,
            Topic::ConversationCreated,
        ]));
        reconciler
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn can_load_older(&self) -> bool {
        self.can_load_older
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply everything queued on the bus since the last call. Returns true
    /// when the sequence changed.
    pub fn process_events(&mut self) -> bool {
        let events = match &self.mailbox {
            Some(mailbox) => mailbox.drain(),
            None => return false,
        };
        let mut changed = false;
        for event in events {
            changed |= self.apply_event(event);
        }
        changed
    }

    fn apply_event(&mut self, event: ChatEvent) -> bool {
        match event {
            ChatEvent::MessageReceived(envelope) if self.follows(&envelope.conversation_id) => {
                self.merge_incoming(&envelope) != MergeOutcome::Ignored
            }
            ChatEvent::MessageSent { origin, message }
                if origin != self.surface && self.follows(&message.conversation_id) =>
            {
                self.merge_message(message) != MergeOutcome::Ignored
            }
            ChatEvent::MessageDeleted(notice) if self.follows(&notice.conversation_id) => {
                self.mark_deleted(&notice.message_id)
            }
            ChatEvent::ConversationCreated {
                temp_id,
                conversation_id,
            } => self.rename_conversation(&temp_id, &conversation_id),
            _ => false,
        }
    }

    fn follows(&self, conversation_id: &ConversationId) -> bool {
        self.target.conversation_id() == Some(conversation_id)
    }

    /// The assistant pseudo-conversation has no server id; its messages are
    /// keyed by the author name.
    fn conversation_key(&self) -> ConversationId {
        match &self.target {
            ChatTarget::Conversation(id) => id.clone(),
            ChatTarget::Assistant => ConversationId::new(ASSISTANT_AUTHOR),
        }
    }

    fn has_history(&self) -> bool {
        matches!(&self.target, ChatTarget::Conversation(id) if !id.is_temporary())
    }

    // ---- history -------------------------------------------------------

    /// Start the first page fetch. `None` means there is nothing to fetch
    /// (assistant or a conversation the server has not created yet).
    pub fn begin_load(&mut self) -> Option<(LoadTicket, u32)> {
        if !self.has_history() {
            self.status = LoadStatus::Ready;
            return None;
        }
        Some(self.issue(FIRST_PAGE))
    }

    pub fn begin_load_older(&mut self) -> Option<(LoadTicket, u32)> {
        if !self.has_history() || !self.can_load_older || self.in_flight.is_some() {
            return None;
        }
        Some(self.issue(self.next_page))
    }

    /// Re-issue the fetch that last failed.
    pub fn begin_retry(&mut self) -> Option<(LoadTicket, u32)> {
        if !matches!(self.status, LoadStatus::Failed { .. }) {
            return None;
        }
        let page = self.last_requested_page.unwrap_or(FIRST_PAGE);
        Some(self.issue(page))
    }

    fn issue(&mut self, page: u32) -> (LoadTicket, u32) {
        let ticket = LoadTicket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed));
        self.in_flight = Some((ticket, page));
        self.last_requested_page = Some(page);
        self.status = LoadStatus::Loading;
        (ticket, page)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Apply a fetched page. Returns false for a stale ticket.
    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<MessagePage, ApiError>,
    ) -> bool {
        match self.in_flight {
            Some((current, _)) if current == ticket => {}
            _ => {
                tracing::debug!(surface = ?self.surface, "stale history page dropped");
                return false;
            }
        }
        self.in_flight = None;
        match result {
            Ok(page) => {
                // The service pages newest-first.
                for message in page.messages.into_iter().rev() {
                    self.merge_message(message);
                }
                self.next_page = page.page.saturating_add(1);
                self.can_load_older = page.has_more;
                self.status = LoadStatus::Ready;
            }
            Err(e) => {
                tracing::warn!(surface = ?self.surface, error = %e, "history fetch failed");
                self.status = LoadStatus::Failed {
                    message: e.user_visible_message(),
                };
            }
        }
        true
    }

    /// Fetch and apply the first page in one step.
    pub async fn load(&mut self, service: &dyn ChatService) -> Result<(), ApiError> {
        let Some((ticket, page)) = self.begin_load() else {
            return Ok(());
        };
        let Some(conversation_id) = self.target.conversation_id().cloned() else {
            return Ok(());
        };
        let result = service
            .messages(&conversation_id, page, self.page_size)
            .await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.finish_load(ticket, result);
        outcome
    }

    // ---- local sends ---------------------------------------------------

    /// Show the draft immediately, before the service has seen it.
    pub fn append_optimistic(&mut self, draft: &Draft) -> Message {
        let message = self.local_message(self.viewer.clone(), draft, DeliveryState::Pending);
        let local_id = message.id.as_str().to_string();
        self.push(message.clone(), Some(local_id));
        message
    }

    /// Append a message that never goes through the service (assistant
    /// conversation).
    pub fn append_local(&mut self, author: UserId, draft: &Draft) -> Message {
        let message = self.local_message(author, draft, DeliveryState::Sent);
        self.push(message.clone(), None);
        message
    }

    fn local_message(&self, author: UserId, draft: &Draft, delivery: DeliveryState) -> Message {
        Message {
            id: MessageId::local(),
            conversation_id: self.conversation_key(),
            from_user_id: author,
            body: MessageBody {
                text: draft.text.clone(),
                resource_urls: draft.resource_urls.clone(),
            },
            kind: draft.kind,
            created_at: Utc::now(),
            delivery,
        }
    }

    /// Swap the optimistic entry for the server's record, in place. A
    /// confirmation whose local entry is gone is appended, never dropped.
    pub fn reconcile_confirmed(&mut self, local_id: &str, server: Message) -> MergeOutcome {
        let server_id = server.server_id().map(str::to_string);
        let local_idx = self.position_of_local(local_id);
        let server_idx = server_id.as_deref().and_then(|id| self.position_of_server(id));

        match (local_idx, server_idx) {
            (Some(l), Some(s)) if l != s => {
                // The echo already landed as its own row; the pending one goes.
                self.entries.remove(l);
                let s = if s > l { s - 1 } else { s };
                self.merge_into(s, server);
                MergeOutcome::Merged
            }
            (Some(l), _) if self.entries[l].message.server_id().is_some() => {
                // An echo already promoted the row; later edits (deletion) win.
                self.merge_into(l, server);
                MergeOutcome::Merged
            }
            (Some(l), _) => {
                let entry = &mut self.entries[l];
                let deleted = entry.message.is_deleted();
                entry.message = Message {
                    delivery: DeliveryState::Sent,
                    ..server
                };
                if deleted {
                    entry.message.kind = ContentKind::Deleted;
                    entry.message.body = MessageBody::default();
                }
                MergeOutcome::Merged
            }
            (None, Some(s)) => {
                self.merge_into(s, server);
                MergeOutcome::Merged
            }
            (None, None) => {
                tracing::debug!(surface = ?self.surface, local_id, "confirmation without local entry; appending");
                self.insert_ordered(Message {
                    delivery: DeliveryState::Sent,
                    ..server
                });
                MergeOutcome::Appended
            }
        }
    }

    /// Remove a failed optimistic send and hand back its draft.
    pub fn rollback(&mut self, local_id: &str) -> Option<Draft> {
        let idx = self.position_of_local(local_id)?;
        if !self.entries[idx].message.is_pending() {
            return None;
        }
        let entry = self.entries.remove(idx);
        Some(Draft {
            text: entry.message.body.text,
            kind: entry.message.kind,
            resource_urls: entry.message.body.resource_urls,
        })
    }

    // ---- merges --------------------------------------------------------

    pub fn merge_incoming(&mut self, envelope: &Envelope) -> MergeOutcome {
        if !self.follows(&envelope.conversation_id) {
            return MergeOutcome::Ignored;
        }
        let message = envelope.clone().into_message();
        if envelope.id.is_none() && self.find_echo(&message).is_some() {
            // Nothing to promote the pending entry to; the confirmation will.
            return MergeOutcome::Echo;
        }
        self.merge_message(message)
    }

    /// Same server id: merge. The viewer's own pending send: echo.
    /// Anything else: insert by timestamp.
    pub fn merge_message(&mut self, message: Message) -> MergeOutcome {
        if let Some(id) = message.server_id() {
            if let Some(idx) = self.position_of_server(id) {
                self.merge_into(idx, message);
                return MergeOutcome::Merged;
            }
        }
        if message.server_id().is_some() {
            if let Some(idx) = self.find_echo(&message) {
                let entry = &mut self.entries[idx];
                entry.message.id = message.id;
                entry.message.created_at = message.created_at;
                entry.message.delivery = DeliveryState::Sent;
                return MergeOutcome::Echo;
            }
        }
        self.insert_ordered(message);
        MergeOutcome::Appended
    }

    /// The earliest pending entry from the viewer with the same content,
    /// within the dedup window.
    fn find_echo(&self, message: &Message) -> Option<usize> {
        if message.from_user_id != self.viewer {
            return None;
        }
        self.entries.iter().position(|e| {
            e.message.is_pending()
                && e.message.kind == message.kind
                && e.message.body == message.body
                && within(e.message.created_at, message.created_at, self.dedup_window)
        })
    }

    fn merge_into(&mut self, idx: usize, incoming: Message) {
        let existing = &mut self.entries[idx].message;
        if incoming.is_deleted() && !existing.is_deleted() {
            existing.kind = ContentKind::Deleted;
            existing.body = MessageBody::default();
        }
        existing.delivery = DeliveryState::Sent;
    }

    /// Deletion changes content only; position and timestamp stay put.
    pub fn mark_deleted(&mut self, message_id: &str) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.message.id.as_str() == message_id)
        else {
            return false;
        };
        let message = &mut self.entries[idx].message;
        if message.is_deleted() {
            return false;
        }
        message.kind = ContentKind::Deleted;
        message.body = MessageBody::default();
        true
    }

    /// Whether `message_id` is the newest entry of this sequence.
    pub fn is_latest(&self, message_id: &str) -> bool {
        self.entries
            .last()
            .is_some_and(|e| e.message.id.as_str() == message_id)
    }

    pub fn rename_conversation(
        &mut self,
        temp_id: &ConversationId,
        conversation_id: &ConversationId,
    ) -> bool {
        let renamed = self.target.renamed(temp_id, conversation_id);
        if renamed == self.target {
            return false;
        }
        self.target = renamed;
        self.surface = self.surface.renamed(temp_id, conversation_id);
        for entry in &mut self.entries {
            if &entry.message.conversation_id == temp_id {
                entry.message.conversation_id = conversation_id.clone();
            }
        }
        true
    }

    fn position_of_local(&self, local_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.local_id.as_deref() == Some(local_id))
    }

    fn position_of_server(&self, server_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.server_id() == Some(server_id))
    }

    fn push(&mut self, message: Message, local_id: Option<String>) {
        let seq = self.bump_seq();
        self.entries.push(Entry {
            message,
            seq,
            local_id,
        });
    }

    /// After the last entry not newer than `message`, so equal timestamps
    /// keep arrival order.
    fn insert_ordered(&mut self, message: Message) {
        let seq = self.bump_seq();
        let at = self
            .entries
            .iter()
            .rposition(|e| e.message.created_at <= message.created_at)
            .map_or(0, |i| i + 1);
        self.entries.insert(
            at,
            Entry {
                message,
                seq,
                local_id: None,
            },
        );
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    #[cfg(test)]
    fn arrival_order(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.seq).collect()
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    (a - b).abs() <= window
}
