//! Floating mini chat windows: how many may be open, and where each docks.

use std::collections::BTreeSet;

use crate::bus::{ChatEvent, EventBus, Mailbox, Topic};
use crate::state::{ChatTarget, ConversationId, UserId};

pub const MAX_MINI_WINDOWS: usize = 3;
pub const WINDOW_WIDTH_PX: u32 = 328;
pub const WINDOW_GAP_PX: u32 = 12;
pub const DOCK_OFFSET_PX: u32 = 24;

/// Requests raised outside the core (profile pages, headers) that ask for a
/// window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowRequest {
    StartChat { user_id: UserId },
    OpenMiniChat { conversation_id: ConversationId },
    OpenMiniAssistant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowPosition {
    pub right_px: u32,
    pub bottom_px: u32,
}

/// Docking offset for the window at stacking slot `index` (0 is rightmost).
pub fn position(index: usize) -> WindowPosition {
    let index = u32::try_from(index).unwrap_or(u32::MAX);
    WindowPosition {
        right_px: DOCK_OFFSET_PX.saturating_add(index.saturating_mul(WINDOW_WIDTH_PX + WINDOW_GAP_PX)),
        bottom_px: 0,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiniWindow {
    pub target: ChatTarget,
    pub minimized: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenOutcome {
    /// False when the target was already open and only moved to the front.
    pub opened: bool,
    pub evicted: Option<ChatTarget>,
}

/// What a drain of the window mailbox changed, for the core to act on.
#[derive(Debug, Default)]
pub struct WindowChanges {
    pub opened: Vec<ChatTarget>,
    pub evicted: Vec<ChatTarget>,
    /// Start-chat requests need the directory to resolve a conversation.
    pub start_chat: Vec<UserId>,
}

impl WindowChanges {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.evicted.is_empty() && self.start_chat.is_empty()
    }
}

pub struct WindowManager {
    max: usize,
    /// Most recently used first.
    windows: Vec<MiniWindow>,
    mailbox: Option<Mailbox>,
}

impl WindowManager {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            windows: Vec::new(),
            mailbox: None,
        }
    }

    pub fn mount(bus: &EventBus, max: usize) -> Self {
        let mut manager = Self::new(max);
        manager.mailbox = Some(bus.mailbox(&[Topic::WindowRequest, Topic::ConversationCreated]));
        manager
    }

    /// Open `target`, or bring it to the front if it is already open. At the
    /// cap, the least recently used window is evicted first.
    pub fn open(&mut self, target: ChatTarget) -> OpenOutcome {
        if let Some(idx) = self.windows.iter().position(|w| w.target == target) {
            let mut window = self.windows.remove(idx);
            window.minimized = false;
            self.windows.insert(0, window);
            return OpenOutcome {
                opened: false,
                evicted: None,
            };
        }
        let evicted = if self.windows.len() >= self.max {
            self.windows.pop().map(|w| w.target)
        } else {
            None
        };
        if let Some(evicted) = &evicted {
            tracing::debug!(?evicted, "mini window evicted");
        }
        self.windows.insert(
            0,
            MiniWindow {
                target,
                minimized: false,
            },
        );
        OpenOutcome {
            opened: true,
            evicted,
        }
    }

    pub fn close(&mut self, target: &ChatTarget) -> bool {
        let before = self.windows.len();
        self.windows.retain(|w| &w.target != target);
        self.windows.len() != before
    }

    pub fn set_minimized(&mut self, target: &ChatTarget, minimized: bool) -> bool {
        match self.windows.iter_mut().find(|w| &w.target == target) {
            Some(window) if window.minimized != minimized => {
                window.minimized = minimized;
                true
            }
            _ => false,
        }
    }

    /// Conversations shown in an expanded window.
    pub fn focused_conversations(&self) -> BTreeSet<ConversationId> {
        self.windows
            .iter()
            .filter(|w| !w.minimized)
            .filter_map(|w| w.target.conversation_id().cloned())
            .collect()
    }

    /// When the real conversation already has a window, the more recently
    /// used of the two slots survives.
    pub fn rename(&mut self, temp_id: &ConversationId, conversation_id: &ConversationId) {
        let mut seen: Vec<ChatTarget> = Vec::with_capacity(self.windows.len());
        self.windows.retain_mut(|window| {
            window.target = window.target.renamed(temp_id, conversation_id);
            if seen.contains(&window.target) {
                tracing::debug!(window = ?window.target, "duplicate mini window merged");
                return false;
            }
            seen.push(window.target.clone());
            true
        });
    }

    pub fn is_open(&self, target: &ChatTarget) -> bool {
        self.windows.iter().any(|w| &w.target == target)
    }

    pub fn windows(&self) -> &[MiniWindow] {
        &self.windows
    }

    pub fn clear(&mut self) -> Vec<ChatTarget> {
        self.windows.drain(..).map(|w| w.target).collect()
    }

    pub fn process_events(&mut self) -> WindowChanges {
        let events = match &self.mailbox {
            Some(mailbox) => mailbox.drain(),
            None => return WindowChanges::default(),
        };
        let mut changes = WindowChanges::default();
        for event in events {
            match event {
                ChatEvent::WindowRequest(WindowRequest::OpenMiniChat { conversation_id }) => {
                    self.record_open(ChatTarget::Conversation(conversation_id), &mut changes);
                }
                ChatEvent::WindowRequest(WindowRequest::OpenMiniAssistant) => {
                    self.record_open(ChatTarget::Assistant, &mut changes);
                }
                ChatEvent::WindowRequest(WindowRequest::StartChat { user_id }) => {
                    changes.start_chat.push(user_id);
                }
                ChatEvent::ConversationCreated {
                    temp_id,
                    conversation_id,
                } => self.rename(&temp_id, &conversation_id),
                _ => {}
            }
        }
        changes
    }

    fn record_open(&mut self, target: ChatTarget, changes: &mut WindowChanges) {
        let outcome = self.open(target.clone());
        if let Some(evicted) = outcome.evicted {
            changes.opened.retain(|t| t != &evicted);
            changes.evicted.push(evicted);
        }
        if outcome.opened {
            changes.opened.push(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> ChatTarget {
        ChatTarget::Conversation(ConversationId::new(id))
    }

    fn targets(manager: &WindowManager) -> Vec<ChatTarget> {
        manager.windows().iter().map(|w| w.target.clone()).collect()
    }

    #[test]
    fn reopening_moves_to_front_without_duplicating() {
        let mut manager = WindowManager::new(MAX_MINI_WINDOWS);
        manager.open(conv("a"));
        manager.open(conv("b"));
        let outcome = manager.open(conv("a"));
        assert!(!outcome.opened);
        assert_eq!(targets(&manager), vec![conv("a"), conv("b")]);
    }

    #[test]
    fn fourth_window_evicts_least_recently_used() {
        let mut manager = WindowManager::new(MAX_MINI_WINDOWS);
        manager.open(conv("a"));
        manager.open(conv("b"));
        manager.open(conv("c"));
        // Touch "a" so "b" becomes the least recently used.
        manager.open(conv("a"));
        let outcome = manager.open(conv("d"));
        assert_eq!(outcome.evicted, Some(conv("b")));
        assert_eq!(manager.windows().len(), 3);
        assert_eq!(targets(&manager), vec![conv("d"), conv("a"), conv("c")]);
    }

    #[test]
    fn close_compacts_positions() {
        let mut manager = WindowManager::new(MAX_MINI_WINDOWS);
        manager.open(conv("a"));
        manager.open(conv("b"));
        manager.open(ChatTarget::Assistant);
        assert!(manager.close(&conv("b")));
        assert!(!manager.close(&conv("b")));
        assert_eq!(targets(&manager), vec![ChatTarget::Assistant, conv("a")]);
        assert_eq!(position(0).right_px, DOCK_OFFSET_PX);
        assert_eq!(
            position(1).right_px,
            DOCK_OFFSET_PX + WINDOW_WIDTH_PX + WINDOW_GAP_PX
        );
    }

    #[test]
    fn minimized_windows_are_not_focused() {
        let mut manager = WindowManager::new(MAX_MINI_WINDOWS);
        manager.open(conv("a"));
        manager.open(conv("b"));
        manager.open(ChatTarget::Assistant);
        assert!(manager.set_minimized(&conv("a"), true));
        let focused: Vec<_> = manager.focused_conversations().into_iter().collect();
        assert_eq!(focused, vec![ConversationId::new("b")]);
    }

    #[test]
    fn rename_onto_an_open_conversation_keeps_one_window() {
        let mut manager = WindowManager::new(MAX_MINI_WINDOWS);
        manager.open(conv("temp-1"));
        manager.open(conv("c9"));
        manager.open(conv("b"));
        manager.rename(&ConversationId::new("temp-1"), &ConversationId::new("c9"));
        assert_eq!(targets(&manager), vec![conv("b"), conv("c9")]);
        assert!(manager.is_open(&conv("c9")));

        // The freed slot is usable again without evicting anything.
        let outcome = manager.open(conv("d"));
        assert!(outcome.opened);
        assert_eq!(outcome.evicted, None);
    }

    #[test]
    fn requests_from_the_bus_open_windows_and_rename_temp_ids() {
        let bus = EventBus::new();
        let mut manager = WindowManager::mount(&bus, 2);
        let temp = ConversationId::new("temp-1");
        bus.publish(ChatEvent::WindowRequest(WindowRequest::OpenMiniChat {
            conversation_id: temp.clone(),
        }));
        bus.publish(ChatEvent::WindowRequest(WindowRequest::StartChat {
            user_id: UserId::new("u2"),
        }));
        bus.publish(ChatEvent::WindowRequest(WindowRequest::OpenMiniAssistant));
        bus.publish(ChatEvent::ConversationCreated {
            temp_id: temp,
            conversation_id: ConversationId::new("c9"),
        });

        let changes = manager.process_events();
        assert_eq!(changes.opened.len(), 2);
        assert_eq!(changes.start_chat, vec![UserId::new("u2")]);
        assert_eq!(targets(&manager), vec![ChatTarget::Assistant, conv("c9")]);
    }
}
