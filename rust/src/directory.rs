//! Conversation list with recency ordering and per-viewer unread counts.
//! Holds previews only, never message bodies.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::api::ChatService;
use crate::bus::{ChatEvent, EventBus, Mailbox, Topic};
use crate::error::ApiError;
use crate::state::{
    Conversation, ConversationId, LoadStatus, Message, MessagePreview, UserId, DELETED_PREVIEW,
};
use crate::wire::DeletionNotice;

/// Unread counts keyed by (conversation, viewer). Entries are created on
/// first increment and never removed.
#[derive(Debug, Default, Clone)]
pub struct UnreadCounter {
    counts: HashMap<(ConversationId, UserId), u32>,
}

impl UnreadCounter {
    pub fn get(&self, conversation_id: &ConversationId, viewer: &UserId) -> u32 {
        self.counts
            .get(&(conversation_id.clone(), viewer.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn increment(&mut self, conversation_id: &ConversationId, viewer: &UserId) -> u32 {
        let count = self
            .counts
            .entry((conversation_id.clone(), viewer.clone()))
            .or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Idempotent.
    pub fn reset(&mut self, conversation_id: &ConversationId, viewer: &UserId) -> bool {
        match self.counts.get_mut(&(conversation_id.clone(), viewer.clone())) {
            Some(count) if *count > 0 => {
                *count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn set(&mut self, conversation_id: &ConversationId, viewer: &UserId, count: u32) {
        self.counts
            .insert((conversation_id.clone(), viewer.clone()), count);
    }

    pub fn rename(&mut self, temp_id: &ConversationId, conversation_id: &ConversationId) {
        let moved: Vec<_> = self
            .counts
            .keys()
            .filter(|(c, _)| c == temp_id)
            .cloned()
            .collect();
        for key in moved {
            if let Some(count) = self.counts.remove(&key) {
                self.counts.insert((conversation_id.clone(), key.1), count);
            }
        }
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Updated,
    Ignored,
    /// The event named a conversation we do not track; only a full refresh
    /// can produce a complete record for it.
    RefreshRequired,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DirectoryChanges {
    pub changed: bool,
    pub refresh_required: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshTicket(u64);

/// Server ids remembered per conversation so a redelivered message is not
/// counted twice.
const COUNTED_IDS_PER_CONVERSATION: usize = 64;

pub struct ConversationDirectory {
    viewer: UserId,
    /// Most recent first.
    conversations: Vec<Conversation>,
    unread: UnreadCounter,
    focused: BTreeSet<ConversationId>,
    counted: HashMap<ConversationId, VecDeque<String>>,
    status: LoadStatus,
    ticket_counter: u64,
    in_flight: Option<RefreshTicket>,
    mailbox: Option<Mailbox>,
}

impl ConversationDirectory {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            conversations: Vec::new(),
            unread: UnreadCounter::default(),
            focused: BTreeSet::new(),
            counted: HashMap::new(),
            status: LoadStatus::Idle,
            ticket_counter: 0,
            in_flight: None,
            mailbox: None,
        }
    }

    pub fn mount(bus: &EventBus, viewer: UserId) -> Self {
        let mut directory = Self::new(viewer);
        directory.mailbox = Some(bus.mailbox(&[
            Topic::MessageReceived,
            Topic::MessageSent,
            Topic::MessageDeleted,
            Topic::ConversationMarkedRead,
            Topic::ConversationCreated,
            Topic::ConversationUpdated,
            Topic::Focus,
        ]));
        directory
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn begin_refresh(&mut self) -> RefreshTicket {
        self.ticket_counter += 1;
        let ticket = RefreshTicket(self.ticket_counter);
        self.in_flight = Some(ticket);
        self.status = LoadStatus::Loading;
        ticket
    }

    /// Replace the list wholesale with the server's. Returns false for a
    /// stale ticket.
    pub fn finish_refresh(
        &mut self,
        ticket: RefreshTicket,
        result: Result<Vec<Conversation>, ApiError>,
    ) -> bool {
        if self.in_flight != Some(ticket) {
            tracing::debug!("stale conversation list dropped");
            return false;
        }
        self.in_flight = None;
        match result {
            Ok(list) => {
                for conv in &list {
                    let count = if self.focused.contains(&conv.id) {
                        0
                    } else {
                        conv.unread_count
                    };
                    self.unread.set(&conv.id, &self.viewer, count);
                }
                self.conversations = list;
                self.sort();
                self.status = LoadStatus::Ready;
                tracing::debug!(count = self.conversations.len(), "conversation list refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "conversation list fetch failed");
                self.status = LoadStatus::Failed {
                    message: e.user_visible_message(),
                };
            }
        }
        true
    }

    pub async fn refresh(&mut self, service: &dyn ChatService) -> Result<(), ApiError> {
        let ticket = self.begin_refresh();
        let result = service.conversations().await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.finish_refresh(ticket, result);
        outcome
    }

    pub fn process_events(&mut self) -> DirectoryChanges {
        let events = match &self.mailbox {
            Some(mailbox) => mailbox.drain(),
            None => return DirectoryChanges::default(),
        };
        let mut changes = DirectoryChanges::default();
        for event in events {
            let outcome = match event {
                ChatEvent::MessageReceived(envelope) => {
                    self.apply_incoming(&envelope.into_message(), true)
                }
                ChatEvent::MessageSent { message, .. } => self.apply_incoming(&message, false),
                ChatEvent::MessageDeleted(notice) => self.apply_deletion(&notice),
                ChatEvent::ConversationMarkedRead {
                    conversation_id,
                    viewer_id,
                } => self.apply_marked_read(&conversation_id, &viewer_id),
                ChatEvent::ConversationCreated {
                    temp_id,
                    conversation_id,
                } => self.apply_created(&temp_id, &conversation_id),
                ChatEvent::ConversationUpdated { .. } => ApplyOutcome::RefreshRequired,
                ChatEvent::FocusChanged { focused } => {
                    self.set_focused(focused);
                    ApplyOutcome::Updated
                }
                _ => ApplyOutcome::Ignored,
            };
            match outcome {
                ApplyOutcome::Updated => changes.changed = true,
                ApplyOutcome::RefreshRequired => changes.refresh_required = true,
                ApplyOutcome::Ignored => {}
            }
        }
        changes
    }

    /// `from_transport` separates deliveries (which may be unread) from the
    /// viewer's own confirmed sends.
    pub fn apply_incoming(&mut self, message: &Message, from_transport: bool) -> ApplyOutcome {
        let viewer = self.viewer.clone();
        let focused = self.focused.contains(&message.conversation_id);
        let Some(conv) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        else {
            if message.conversation_id.is_temporary() {
                return ApplyOutcome::Ignored;
            }
            return ApplyOutcome::RefreshRequired;
        };

        let newer = conv
            .last_message
            .as_ref()
            .map_or(true, |p| message.created_at >= p.at);
        if newer {
            conv.last_message = Some(MessagePreview {
                text: message.preview_text(),
                at: message.created_at,
                message_id: message.server_id().map(str::to_string),
            });
        }
        if from_transport
            && message.from_user_id != viewer
            && !focused
            && self.first_delivery(message)
        {
            self.unread.increment(&message.conversation_id, &viewer);
        }
        self.sort();
        ApplyOutcome::Updated
    }

    /// False when this server id was already counted for its conversation.
    /// Messages without a server id are always new.
    fn first_delivery(&mut self, message: &Message) -> bool {
        let Some(id) = message.server_id() else {
            return true;
        };
        let seen = self
            .counted
            .entry(message.conversation_id.clone())
            .or_default();
        if seen.iter().any(|s| s == id) {
            tracing::debug!(message_id = id, "redelivered message not counted again");
            return false;
        }
        if seen.len() >= COUNTED_IDS_PER_CONVERSATION {
            seen.pop_front();
        }
        seen.push_back(id.to_string());
        true
    }

    /// Only a deletion of the latest message may touch the preview.
    pub fn apply_deletion(&mut self, notice: &DeletionNotice) -> ApplyOutcome {
        if !notice.is_latest {
            return ApplyOutcome::Ignored;
        }
        let Some(conv) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == notice.conversation_id)
        else {
            return ApplyOutcome::Ignored;
        };
        match conv.last_message.as_mut() {
            Some(preview) if preview.text != DELETED_PREVIEW => {
                preview.text = DELETED_PREVIEW.to_string();
                ApplyOutcome::Updated
            }
            _ => ApplyOutcome::Ignored,
        }
    }

    /// Idempotent.
    pub fn apply_marked_read(
        &mut self,
        conversation_id: &ConversationId,
        viewer: &UserId,
    ) -> ApplyOutcome {
        if self.unread.reset(conversation_id, viewer) {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Ignored
        }
    }

    /// A temporary conversation became real. The directory never held the
    /// temporary one, so it asks for the server's record.
    pub fn apply_created(
        &mut self,
        temp_id: &ConversationId,
        conversation_id: &ConversationId,
    ) -> ApplyOutcome {
        self.unread.rename(temp_id, conversation_id);
        if let Some(seen) = self.counted.remove(temp_id) {
            self.counted
                .entry(conversation_id.clone())
                .or_default()
                .extend(seen);
        }
        if self.focused.remove(temp_id) {
            self.focused.insert(conversation_id.clone());
        }
        if self.get(conversation_id).is_some() {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::RefreshRequired
        }
    }

    /// Focused conversations never accumulate unread messages.
    pub fn set_focused(&mut self, focused: BTreeSet<ConversationId>) {
        for id in &focused {
            self.unread.reset(id, &self.viewer);
        }
        self.focused = focused;
    }

    pub fn unread_count(&self, conversation_id: &ConversationId) -> u32 {
        self.unread.get(conversation_id, &self.viewer)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .map(|c| self.unread_count(&c.id))
            .fold(0u32, u32::saturating_add)
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == conversation_id)
    }

    pub fn find_private_with(&self, user_id: &UserId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.is_private_with(user_id))
    }

    /// Snapshot with unread counts filled in.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations
            .iter()
            .map(|c| Conversation {
                unread_count: self.unread_count(&c.id),
                ..c.clone()
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.unread.clear();
        self.focused.clear();
        self.counted.clear();
        self.in_flight = None;
        self.status = LoadStatus::Idle;
    }

    /// Stable, so conversations with equal (or no) activity keep their order.
    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::state::{
        ContentKind, ConversationKind, DeliveryState, MessageBody, MessageId,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn conversation(id: &str, last_at: i64, unread: u32) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            kind: ConversationKind::Private,
            participant_ids: ["A", id].into_iter().map(UserId::from).collect(),
            title: None,
            last_message: Some(MessagePreview {
                text: format!("last in {id}"),
                at: at(last_at),
                message_id: Some(format!("{id}-last")),
            }),
            unread_count: unread,
        }
    }

    fn message(conv: &str, from: &str, text: &str, when: i64) -> Message {
        Message {
            id: MessageId::Server(format!("{conv}-{when}")),
            conversation_id: ConversationId::new(conv),
            from_user_id: UserId::new(from),
            body: MessageBody {
                text: text.into(),
                resource_urls: vec![],
            },
            kind: ContentKind::Text,
            created_at: at(when),
            delivery: DeliveryState::Sent,
        }
    }

    fn loaded(list: Vec<Conversation>) -> ConversationDirectory {
        let mut dir = ConversationDirectory::new(UserId::new("A"));
        let ticket = dir.begin_refresh();
        assert!(dir.finish_refresh(ticket, Ok(list)));
        dir
    }

    fn order(dir: &ConversationDirectory) -> Vec<String> {
        dir.conversations()
            .iter()
            .map(|c| c.id.to_string())
            .collect()
    }

    #[test]
    fn refresh_replaces_and_sorts_by_recency() {
        let dir = loaded(vec![
            conversation("old", 1, 0),
            conversation("new", 9, 2),
            conversation("mid", 5, 0),
        ]);
        assert_eq!(order(&dir), vec!["new", "mid", "old"]);
        assert_eq!(dir.total_unread(), 2);
        assert_eq!(dir.status(), &LoadStatus::Ready);
    }

    #[test]
    fn incoming_updates_preview_and_moves_to_top() {
        let mut dir = loaded(vec![conversation("c1", 1, 0), conversation("c2", 5, 0)]);
        let outcome = dir.apply_incoming(&message("c1", "B", "hi", 10), true);
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(order(&dir), vec!["c1", "c2"]);
        let c1 = dir.get(&ConversationId::new("c1")).unwrap();
        let preview = c1.last_message.as_ref().unwrap();
        assert_eq!(preview.text, "hi");
        assert_eq!(preview.at, at(10));
        assert_eq!(dir.unread_count(&ConversationId::new("c1")), 1);
    }

    #[test]
    fn older_message_does_not_clobber_newer_preview() {
        let mut dir = loaded(vec![conversation("c1", 10, 0)]);
        dir.apply_incoming(&message("c1", "B", "stale", 3), true);
        let c1 = dir.get(&ConversationId::new("c1")).unwrap();
        assert_eq!(c1.last_message.as_ref().unwrap().text, "last in c1");
    }

    #[test]
    fn focused_and_own_messages_do_not_count_as_unread() {
        let mut dir = loaded(vec![conversation("c1", 1, 0), conversation("c2", 1, 0)]);
        dir.set_focused([ConversationId::new("c1")].into_iter().collect());
        dir.apply_incoming(&message("c1", "B", "seen", 2), true);
        dir.apply_incoming(&message("c2", "A", "mine", 3), true);
        dir.apply_incoming(&message("c2", "B", "sent elsewhere", 4), false);
        assert_eq!(dir.total_unread(), 0);
    }

    #[test]
    fn redelivered_message_is_counted_once() {
        let mut dir = loaded(vec![conversation("c1", 1, 0)]);
        let m = message("c1", "B", "hi", 5);
        assert_eq!(dir.apply_incoming(&m, true), ApplyOutcome::Updated);
        dir.apply_incoming(&m, true);
        assert_eq!(dir.unread_count(&ConversationId::new("c1")), 1);

        dir.apply_incoming(&message("c1", "B", "again", 6), true);
        assert_eq!(dir.unread_count(&ConversationId::new("c1")), 2);
    }

    #[test]
    fn untracked_conversation_requires_refresh() {
        let mut dir = loaded(vec![conversation("c1", 1, 0)]);
        assert_eq!(
            dir.apply_incoming(&message("c9", "B", "new", 2), true),
            ApplyOutcome::RefreshRequired
        );
        assert!(dir.get(&ConversationId::new("c9")).is_none());
    }

    #[test]
    fn deletion_touches_preview_only_when_latest() {
        let mut dir = loaded(vec![conversation("c1", 1, 0)]);
        let mut notice = DeletionNotice {
            conversation_id: ConversationId::new("c1"),
            message_id: "older".into(),
            is_latest: false,
        };
        assert_eq!(dir.apply_deletion(&notice), ApplyOutcome::Ignored);
        let text = |dir: &ConversationDirectory| {
            dir.get(&ConversationId::new("c1"))
                .and_then(|c| c.last_message.clone())
                .map(|p| p.text)
        };
        assert_eq!(text(&dir).as_deref(), Some("last in c1"));

        notice.is_latest = true;
        assert_eq!(dir.apply_deletion(&notice), ApplyOutcome::Updated);
        assert_eq!(text(&dir).as_deref(), Some(DELETED_PREVIEW));
    }

    #[test]
    fn marked_read_is_idempotent() {
        let mut dir = loaded(vec![conversation("c1", 1, 4)]);
        let c1 = ConversationId::new("c1");
        let viewer = UserId::new("A");
        assert_eq!(dir.apply_marked_read(&c1, &viewer), ApplyOutcome::Updated);
        assert_eq!(dir.unread_count(&c1), 0);
        assert_eq!(dir.apply_marked_read(&c1, &viewer), ApplyOutcome::Ignored);
        assert_eq!(dir.unread_count(&c1), 0);
        // Another viewer's read receipt leaves ours alone.
        dir.apply_incoming(&message("c1", "B", "again", 5), true);
        dir.apply_marked_read(&c1, &UserId::new("B"));
        assert_eq!(dir.unread_count(&c1), 1);
    }

    #[test]
    fn stale_refresh_is_dropped() {
        let mut dir = ConversationDirectory::new(UserId::new("A"));
        let first = dir.begin_refresh();
        let second = dir.begin_refresh();
        assert!(!dir.finish_refresh(first, Ok(vec![conversation("c1", 1, 0)])));
        assert!(dir.conversations().is_empty());
        assert!(dir.finish_refresh(second, Err(ApiError::Network("down".into()))));
        assert!(matches!(dir.status(), LoadStatus::Failed { .. }));
    }

    #[test]
    fn bus_events_drive_the_directory() {
        let bus = EventBus::new();
        let mut dir = ConversationDirectory::mount(&bus, UserId::new("A"));
        let ticket = dir.begin_refresh();
        dir.finish_refresh(ticket, Ok(vec![conversation("c1", 1, 0)]));

        bus.publish(ChatEvent::MessageReceived(crate::wire::Envelope {
            id: Some("m1".into()),
            conversation_id: ConversationId::new("c1"),
            from_user_id: UserId::new("B"),
            message: "hi".into(),
            kind: ContentKind::Text,
            resource_urls: vec![],
            created_at: at(5),
        }));
        let changes = dir.process_events();
        assert_eq!(
            changes,
            DirectoryChanges {
                changed: true,
                refresh_required: false
            }
        );
        assert_eq!(dir.total_unread(), 1);

        bus.publish(ChatEvent::FocusChanged {
            focused: [ConversationId::new("c1")].into_iter().collect(),
        });
        bus.publish(ChatEvent::ConversationUpdated {
            conversation_id: None,
        });
        let changes = dir.process_events();
        assert!(changes.refresh_required);
        assert_eq!(dir.total_unread(), 0);
    }

    #[test]
    fn counter_rename_moves_counts() {
        let mut counter = UnreadCounter::default();
        let temp = ConversationId::new("temp-1");
        let real = ConversationId::new("c1");
        let viewer = UserId::new("A");
        counter.increment(&temp, &viewer);
        counter.rename(&temp, &real);
        assert_eq!(counter.get(&temp, &viewer), 0);
        assert_eq!(counter.get(&real, &viewer), 1);
    }
}
