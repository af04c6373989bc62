//! Typed, process-wide publish/subscribe between the transport and every
//! mounted chat surface.
//!
//! Delivery is synchronous and in subscription order. A handler that fails or
//! panics is logged and skipped; the remaining handlers still see the event.
//! Only per-handler FIFO is guaranteed, nothing across topics.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use flume::{Receiver, Sender};

use crate::state::{ConversationId, Message, SurfaceId, UserId};
use crate::windows::WindowRequest;
use crate::wire::{DeletionNotice, Envelope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    MessageReceived,
    MessageSent,
    MessageDeleted,
    ConversationMarkedRead,
    ConversationCreated,
    ConversationUpdated,
    Focus,
    WindowRequest,
    OpaqueFrame,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String, will_retry: bool },
    Error { message: String },
}

#[derive(Clone, Debug)]
pub enum ChatEvent {
    Connection(ConnectionEvent),
    /// A message delivered by the transport.
    MessageReceived(Envelope),
    /// A locally originated send confirmed by the server, for every surface
    /// other than `origin`.
    MessageSent {
        origin: SurfaceId,
        message: Message,
    },
    MessageDeleted(DeletionNotice),
    ConversationMarkedRead {
        conversation_id: ConversationId,
        viewer_id: UserId,
    },
    /// A temporary conversation id was replaced by the server's.
    ConversationCreated {
        temp_id: ConversationId,
        conversation_id: ConversationId,
    },
    ConversationUpdated {
        conversation_id: Option<ConversationId>,
    },
    FocusChanged {
        focused: BTreeSet<ConversationId>,
    },
    WindowRequest(WindowRequest),
    /// A frame the transport could not normalize, passed through untouched.
    OpaqueFrame {
        raw: String,
    },
}

impl ChatEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Connection(_) => Topic::Connection,
            Self::MessageReceived(_) => Topic::MessageReceived,
            Self::MessageSent { .. } => Topic::MessageSent,
            Self::MessageDeleted(_) => Topic::MessageDeleted,
            Self::ConversationMarkedRead { .. } => Topic::ConversationMarkedRead,
            Self::ConversationCreated { .. } => Topic::ConversationCreated,
            Self::ConversationUpdated { .. } => Topic::ConversationUpdated,
            Self::FocusChanged { .. } => Topic::Focus,
            Self::WindowRequest(_) => Topic::WindowRequest,
            Self::OpaqueFrame { .. } => Topic::OpaqueFrame,
        }
    }
}

type Handler = Arc<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;

struct Slot {
    id: u64,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    slots: RwLock<Vec<Slot>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        match self.slots.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        match self.slots.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn remove(&self, ids: &[u64]) {
        self.write_slots().retain(|s| !ids.contains(&s.id));
    }
}

/// Cheap to clone; every clone is the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.insert(topic, Arc::new(handler));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            ids: id.into_iter().collect(),
        }
    }

    /// Queue every event of `topics` for the caller to drain at its own pace.
    pub fn mailbox(&self, topics: &[Topic]) -> Mailbox {
        let (tx, rx) = flume::unbounded();
        let ids = topics
            .iter()
            .filter_map(|topic| self.insert(*topic, forward_to(tx.clone())))
            .collect();
        Mailbox {
            _subscription: Subscription {
                inner: Arc::downgrade(&self.inner),
                ids,
            },
            rx,
        }
    }

    /// Returns how many handlers accepted the event.
    pub fn publish(&self, event: ChatEvent) -> usize {
        if self.is_shut_down() {
            tracing::debug!(topic = ?event.topic(), "publish after shutdown dropped");
            return 0;
        }
        let topic = event.topic();
        // Snapshot so handlers may (un)subscribe while we deliver.
        let handlers: Vec<Handler> = self
            .inner
            .read_slots()
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| s.handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(?topic, error = %e, "event handler failed"),
                Err(_) => tracing::warn!(?topic, "event handler panicked"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .read_slots()
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Drop every subscriber. Later publishes and subscriptions are no-ops.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.write_slots().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn insert(&self, topic: Topic, handler: Handler) -> Option<u64> {
        if self.is_shut_down() {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write_slots().push(Slot { id, topic, handler });
        Some(id)
    }
}

fn forward_to(tx: Sender<ChatEvent>) -> Handler {
    Arc::new(move |event: &ChatEvent| {
        tx.send(event.clone())
            .map_err(|_| anyhow::anyhow!("mailbox receiver dropped"))
    })
}

/// Disposer returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    ids: Vec<u64>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(&self.ids);
        }
    }
}

/// A subscription whose events are queued instead of handled inline.
pub struct Mailbox {
    _subscription: Subscription,
    rx: Receiver<ChatEvent>,
}

impl Mailbox {
    pub fn drain(&self) -> Vec<ChatEvent> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
