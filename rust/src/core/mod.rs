mod config;
mod session;
mod surfaces;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::api::{AssistantBridge, SharedChatService};
use crate::bus::{ChatEvent, EventBus, Subscription, Topic};
use crate::directory::ConversationDirectory;
use crate::reconciler::MessageReconciler;
use crate::state::{
    AppState, ChatTarget, ChatViewState, ConversationId, MiniWindowState, SurfaceId, UserId,
};
use crate::transport::Transport;
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};
use crate::windows::{self, WindowManager, WindowRequest};

pub(crate) use config::{default_app_config_json, CONFIG_FILE_NAME};

const ASSISTANT_TITLE: &str = "Assistant";

/// One mounted chat surface: its own reconciler and its own inline errors.
struct Surface {
    reconciler: MessageReconciler,
    send_error: Option<String>,
    restored_draft: Option<String>,
}

impl Surface {
    fn new(reconciler: MessageReconciler) -> Self {
        Self {
            reconciler,
            send_error: None,
            restored_draft: None,
        }
    }
}

struct Session {
    viewer: UserId,
    service: SharedChatService,
    transport: Option<Transport>,
    directory: ConversationDirectory,
    windows: WindowManager,
    surfaces: HashMap<SurfaceId, Surface>,
    focused: BTreeSet<ConversationId>,
    /// Peer of each conversation started locally and not yet created.
    temp_peers: HashMap<ConversationId, UserId>,
    /// Retired temporary ids and their replacements.
    renamed: HashMap<ConversationId, ConversationId>,
}

pub struct ChatCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,
    bus: EventBus,
    _bus_wake: Subscription,

    service_override: Option<SharedChatService>,
    assistant: Arc<dyn AssistantBridge>,

    session: Option<Session>,
    // Bumped on every session start/stop; async results from an older epoch
    // are dropped.
    epoch: u64,
    shut_down: bool,
}

impl ChatCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        service_override: Option<SharedChatService>,
        assistant: Arc<dyn AssistantBridge>,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            // Only fails when the OS refuses threads; the core cannot run without it.
            .expect("tokio runtime");

        let bus = EventBus::new();
        // Window requests may come from outside the actor; make sure they are
        // picked up without waiting for the next action.
        let wake_tx = core_sender.clone();
        let bus_wake = bus.subscribe(Topic::WindowRequest, move |_| {
            wake_tx
                .send(CoreMsg::Internal(Box::new(InternalEvent::BusWake)))
                .map_err(|_| anyhow::anyhow!("core stopped"))
        });

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            bus,
            _bus_wake: bus_wake,
            service_override,
            assistant,
            session: None,
            epoch: 0,
            shut_down: false,
        };

        // Ensure ChatApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_draft_restored(&mut self, surface: SurfaceId, text: String) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream even though this is a side-effect update.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::DraftRestored { rev, surface, text });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Kept in state until the UI clears it.
        self.state.toast = Some(msg.into());
    }

    /// Run `fut` on the network runtime and feed its result back to the actor.
    fn spawn_internal<F>(&self, fut: F)
    where
        F: Future<Output = InternalEvent> + Send + 'static,
    {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let event = fut.await;
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        if self.shut_down {
            return;
        }
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain tokens and drafts.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Shutdown => {
                tracing::info!("shutdown");
                self.stop_session();
                self.bus.shutdown();
                self.shut_down = true;
                self.state = AppState::empty();
                self.emit_state();
                return;
            }
        }
        self.sync_components();
        self.rebuild_state();
        self.emit_state();
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Session
            AppAction::StartSession { viewer_id, token } => {
                if let Err(e) = self.start_session(&viewer_id, token) {
                    self.toast(format!("Sign in failed: {e:#}"));
                }
            }
            AppAction::EndSession => {
                self.stop_session();
                self.state = AppState {
                    rev: self.rev,
                    ..AppState::empty()
                };
            }

            // Conversation list
            AppAction::RefreshConversations => self.start_refresh(),
            AppAction::MarkRead { conversation_id } => self.request_mark_read(conversation_id),
            AppAction::CreateGroup { name, member_ids } => self.create_group(name, member_ids),

            // Full chat page
            AppAction::OpenConversation { conversation_id } => {
                self.open_page(ChatTarget::Conversation(conversation_id));
            }
            AppAction::CloseConversation => {
                if let Some(sess) = self.session.as_mut() {
                    sess.surfaces.remove(&SurfaceId::ChatPage);
                }
            }

            // Mini windows are requested over the bus like any outside caller.
            AppAction::StartChat { user_id } => {
                self.request_window(WindowRequest::StartChat { user_id });
            }
            AppAction::OpenMiniChat { conversation_id } => {
                self.request_window(WindowRequest::OpenMiniChat { conversation_id });
            }
            AppAction::OpenAssistant => self.request_window(WindowRequest::OpenMiniAssistant),
            AppAction::CloseMiniChat { target } => {
                if let Some(sess) = self.session.as_mut() {
                    if sess.windows.close(&target) {
                        sess.surfaces.remove(&SurfaceId::MiniWindow(target));
                    }
                }
            }
            AppAction::SetMiniWindowMinimized { target, minimized } => {
                if let Some(sess) = self.session.as_mut() {
                    sess.windows.set_minimized(&target, minimized);
                }
            }

            // Any surface
            AppAction::LoadOlderMessages { surface } => {
                self.start_history_load(&surface, surfaces::HistoryFetch::Older);
            }
            AppAction::RetryLoad { surface } => {
                self.start_history_load(&surface, surfaces::HistoryFetch::Retry);
            }
            AppAction::SendMessage {
                surface,
                text,
                kind,
                resource_urls,
            } => self.send_message(surface, text, kind, resource_urls),
            AppAction::DeleteMessage {
                surface,
                message_id,
            } => self.delete_message(surface, message_id),
            AppAction::DismissSendError { surface } => {
                if let Some(s) = self.surface_mut(&surface) {
                    s.send_error = None;
                    s.restored_draft = None;
                }
            }

            // UI
            AppAction::ClearToast => self.state.toast = None,
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        let epoch = match &internal {
            InternalEvent::Transport { epoch, .. }
            | InternalEvent::ConversationsLoaded { epoch, .. }
            | InternalEvent::HistoryLoaded { epoch, .. }
            | InternalEvent::SendCompleted { epoch, .. }
            | InternalEvent::AssistantReplied { epoch, .. }
            | InternalEvent::MarkedRead { epoch, .. }
            | InternalEvent::DeleteCompleted { epoch, .. }
            | InternalEvent::GroupCreated { epoch, .. } => Some(*epoch),
            InternalEvent::InjectedFrame { .. } | InternalEvent::BusWake => None,
        };
        // Ignore results from a session that has since ended.
        if let Some(epoch) = epoch {
            if epoch != self.epoch || self.session.is_none() {
                tracing::debug!(epoch, current = self.epoch, "stale internal event dropped");
                return;
            }
        }

        match internal {
            InternalEvent::Transport { event, .. } => self.handle_transport_event(event),
            InternalEvent::ConversationsLoaded { ticket, result, .. } => {
                if let Some(sess) = self.session.as_mut() {
                    sess.directory.finish_refresh(ticket, result);
                }
            }
            InternalEvent::HistoryLoaded {
                surface,
                ticket,
                result,
                ..
            } => self.finish_history_load(surface, ticket, result),
            InternalEvent::SendCompleted {
                surface,
                local_id,
                conversation_id,
                result,
                ..
            } => self.finish_send(surface, local_id, conversation_id, result),
            InternalEvent::AssistantReplied {
                surface, result, ..
            } => self.finish_assistant_reply(surface, result),
            InternalEvent::MarkedRead {
                conversation_id,
                result,
                ..
            } => self.finish_mark_read(conversation_id, result),
            InternalEvent::DeleteCompleted {
                surface,
                conversation_id,
                message_id,
                is_latest,
                result,
                ..
            } => self.finish_delete(surface, conversation_id, message_id, is_latest, result),
            InternalEvent::GroupCreated { result, .. } => self.finish_create_group(result),
            InternalEvent::BusWake => {}
            InternalEvent::InjectedFrame { raw } => {
                self.handle_inbound(crate::transport::parse_frame(&raw));
            }
        }
    }

    fn request_window(&mut self, request: WindowRequest) {
        if self.session.is_none() {
            self.toast("Sign in to chat");
            return;
        }
        self.bus.publish(ChatEvent::WindowRequest(request));
    }

    /// Let every component catch up on the bus, in dependency order: windows
    /// decide which surfaces exist, focus follows the surfaces, then the
    /// directory and each surface drain their own mailboxes.
    fn sync_components(&mut self) {
        self.sync_windows();
        self.recompute_focus();

        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let changes = sess.directory.process_events();
        let refresh = changes.refresh_required && !sess.directory.is_refreshing();
        for surface in sess.surfaces.values_mut() {
            surface.reconciler.process_events();
        }
        if refresh {
            self.start_refresh();
        }
    }

    fn sync_windows(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let mut changes = sess.windows.process_events();
        for user_id in std::mem::take(&mut changes.start_chat) {
            if user_id == sess.viewer {
                continue;
            }
            let conversation_id = resolve_start_chat(sess, &user_id);
            let target = ChatTarget::Conversation(conversation_id);
            let outcome = sess.windows.open(target.clone());
            if let Some(evicted) = outcome.evicted {
                changes.opened.retain(|t| t != &evicted);
                changes.evicted.push(evicted);
            }
            if outcome.opened {
                changes.opened.push(target);
            }
        }
        for evicted in changes.evicted {
            sess.surfaces.remove(&SurfaceId::MiniWindow(evicted));
        }
        for target in changes.opened {
            self.mount_surface(SurfaceId::MiniWindow(target.clone()), target);
        }
    }

    fn recompute_focus(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let mut focused = sess.windows.focused_conversations();
        if let Some(page) = sess.surfaces.get(&SurfaceId::ChatPage) {
            if let Some(id) = page.reconciler.target().conversation_id() {
                focused.insert(id.clone());
            }
        }
        if focused == sess.focused {
            return;
        }
        let newly_focused: Vec<ConversationId> = focused
            .difference(&sess.focused)
            .filter(|id| !id.is_temporary())
            .cloned()
            .collect();
        sess.focused = focused.clone();
        self.bus.publish(ChatEvent::FocusChanged { focused });
        for conversation_id in newly_focused {
            self.request_mark_read(conversation_id);
        }
    }

    fn rebuild_state(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        self.state.viewer_id = Some(sess.viewer.clone());
        self.state.conversations = sess.directory.conversations();
        self.state.conversations_status = sess.directory.status().clone();
        self.state.total_unread = sess.directory.total_unread();
        self.state.current_chat = sess
            .surfaces
            .get(&SurfaceId::ChatPage)
            .map(|surface| chat_view(sess, &SurfaceId::ChatPage, surface));
        self.state.mini_windows = sess
            .windows
            .windows()
            .iter()
            .enumerate()
            .map(|(index, window)| {
                let surface_id = SurfaceId::MiniWindow(window.target.clone());
                MiniWindowState {
                    target: window.target.clone(),
                    minimized: window.minimized,
                    position: windows::position(index),
                    view: sess
                        .surfaces
                        .get(&surface_id)
                        .map(|surface| chat_view(sess, &surface_id, surface)),
                }
            })
            .collect();
    }
}

/// An existing private conversation with `user_id`, else a pending temporary
/// one for the same peer, else a fresh temporary id.
fn resolve_start_chat(sess: &mut Session, user_id: &UserId) -> ConversationId {
    if let Some(conv) = sess.directory.find_private_with(user_id) {
        return conv.id.clone();
    }
    if let Some((temp_id, _)) = sess.temp_peers.iter().find(|(_, peer)| *peer == user_id) {
        return temp_id.clone();
    }
    let temp_id = ConversationId::temporary();
    tracing::debug!(%temp_id, peer = %user_id, "started chat with temporary id");
    sess.temp_peers.insert(temp_id.clone(), user_id.clone());
    temp_id
}

fn title_for(sess: &Session, target: &ChatTarget) -> String {
    match target {
        ChatTarget::Assistant => ASSISTANT_TITLE.to_string(),
        ChatTarget::Conversation(id) => {
            if let Some(conv) = sess.directory.get(id) {
                conv.display_title(&sess.viewer)
            } else if let Some(peer) = sess.temp_peers.get(id) {
                peer.to_string()
            } else {
                id.to_string()
            }
        }
    }
}

fn chat_view(sess: &Session, surface_id: &SurfaceId, surface: &Surface) -> ChatViewState {
    let target = surface.reconciler.target().clone();
    ChatViewState {
        surface: surface_id.clone(),
        title: title_for(sess, &target),
        target,
        messages: surface.reconciler.messages(),
        can_load_older: surface.reconciler.can_load_older(),
        load_status: surface.reconciler.status().clone(),
        send_error: surface.send_error.clone(),
        restored_draft: surface.restored_draft.clone(),
    }
}
