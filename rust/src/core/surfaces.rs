// Chat surfaces: mounting, history paging, sends and deletions.

use super::*;
use crate::api::{SendDestination, SendRequest};
use crate::error::ApiError;
use crate::reconciler::{Draft, LoadTicket};
use crate::state::{ContentKind, Message, ASSISTANT_AUTHOR};
use crate::wire::{DeletionNotice, MessagePage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum HistoryFetch {
    Initial,
    Older,
    Retry,
}

/// Work a send hands to the runtime once the surface borrow is released.
enum Outgoing {
    Assistant {
        history: Vec<Message>,
        prompt: String,
    },
    Service {
        request: SendRequest,
        local_id: String,
        conversation_id: ConversationId,
    },
}

impl ChatCore {
    /// Follow temporary-id swaps so late results find the renamed surface.
    pub(super) fn resolve_surface(&self, surface: &SurfaceId) -> SurfaceId {
        let Some(sess) = self.session.as_ref() else {
            return surface.clone();
        };
        let mut resolved = surface.clone();
        loop {
            let next = match &resolved {
                SurfaceId::MiniWindow(ChatTarget::Conversation(id)) => sess
                    .renamed
                    .get(id)
                    .map(|real| resolved.renamed(id, real)),
                _ => None,
            };
            match next {
                Some(next) => resolved = next,
                None => return resolved,
            }
        }
    }

    pub(super) fn surface_mut(&mut self, surface: &SurfaceId) -> Option<&mut Surface> {
        let resolved = self.resolve_surface(surface);
        self.session.as_mut()?.surfaces.get_mut(&resolved)
    }

    pub(super) fn open_page(&mut self, target: ChatTarget) {
        let Some(sess) = self.session.as_ref() else {
            self.toast("Sign in to chat");
            return;
        };
        if let Some(page) = sess.surfaces.get(&SurfaceId::ChatPage) {
            if page.reconciler.target() == &target {
                return;
            }
        }
        self.mount_surface(SurfaceId::ChatPage, target);
    }

    /// Mount a fresh reconciler for `surface_id`, replacing any previous one,
    /// and start its first history fetch.
    pub(super) fn mount_surface(&mut self, surface_id: SurfaceId, target: ChatTarget) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        tracing::debug!(surface = ?surface_id, "mount surface");
        let reconciler = MessageReconciler::mount(
            &self.bus,
            surface_id.clone(),
            target,
            sess.viewer.clone(),
            self.config.dedup_window(),
            self.config.history_page_size(),
        );
        sess.surfaces
            .insert(surface_id.clone(), Surface::new(reconciler));
        self.start_history_load(&surface_id, HistoryFetch::Initial);
    }

    pub(super) fn start_history_load(&mut self, surface: &SurfaceId, fetch: HistoryFetch) {
        let epoch = self.epoch;
        let surface_id = self.resolve_surface(surface);
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let Some(s) = sess.surfaces.get_mut(&surface_id) else {
            tracing::debug!(surface = ?surface_id, "history load for unmounted surface");
            return;
        };
        let issued = match fetch {
            HistoryFetch::Initial => s.reconciler.begin_load(),
            HistoryFetch::Older => s.reconciler.begin_load_older(),
            HistoryFetch::Retry => s.reconciler.begin_retry(),
        };
        let Some((ticket, page)) = issued else {
            return;
        };
        let Some(conversation_id) = s.reconciler.target().conversation_id().cloned() else {
            return;
        };
        let limit = s.reconciler.page_size();
        let service = sess.service.clone();
        self.spawn_internal(async move {
            let result = service.messages(&conversation_id, page, limit).await;
            InternalEvent::HistoryLoaded {
                epoch,
                surface: surface_id,
                ticket,
                result,
            }
        });
    }

    pub(super) fn finish_history_load(
        &mut self,
        surface: SurfaceId,
        ticket: LoadTicket,
        result: Result<MessagePage, ApiError>,
    ) {
        match self.surface_mut(&surface) {
            Some(s) => {
                s.reconciler.finish_load(ticket, result);
            }
            None => tracing::debug!(surface = ?surface, "history page for unmounted surface dropped"),
        }
    }

    pub(super) fn send_message(
        &mut self,
        surface: SurfaceId,
        text: String,
        kind: ContentKind,
        resource_urls: Vec<String>,
    ) {
        let draft = Draft {
            text,
            kind,
            resource_urls,
        };
        if draft.is_empty() {
            return;
        }
        let epoch = self.epoch;
        let surface_id = self.resolve_surface(&surface);
        let Some(sess) = self.session.as_mut() else {
            self.toast("Sign in to chat");
            return;
        };
        let Some(s) = sess.surfaces.get_mut(&surface_id) else {
            self.toast("This chat is no longer open");
            return;
        };
        s.send_error = None;
        s.restored_draft = None;

        let outgoing = match s.reconciler.target().clone() {
            ChatTarget::Assistant => {
                let history = s.reconciler.messages();
                s.reconciler.append_local(sess.viewer.clone(), &draft);
                Outgoing::Assistant {
                    history,
                    prompt: draft.text,
                }
            }
            ChatTarget::Conversation(conversation_id) => {
                let destination = if conversation_id.is_temporary() {
                    match sess.temp_peers.get(&conversation_id) {
                        Some(peer) => SendDestination::User(peer.clone()),
                        None => {
                            s.send_error = Some("This conversation is no longer available".into());
                            return;
                        }
                    }
                } else {
                    match sess.directory.get(&conversation_id).and_then(|c| c.group_id()) {
                        Some(group_id) => SendDestination::Group(group_id.to_string()),
                        None => SendDestination::Conversation(conversation_id.clone()),
                    }
                };
                let pending = s.reconciler.append_optimistic(&draft);
                Outgoing::Service {
                    request: SendRequest::new(
                        destination,
                        draft.text,
                        draft.kind,
                        draft.resource_urls,
                    ),
                    local_id: pending.id.as_str().to_string(),
                    conversation_id,
                }
            }
        };

        match outgoing {
            Outgoing::Assistant { history, prompt } => {
                let assistant = self.assistant.clone();
                self.spawn_internal(async move {
                    let result = assistant.reply(&history, &prompt).await;
                    InternalEvent::AssistantReplied {
                        epoch,
                        surface: surface_id,
                        result,
                    }
                });
            }
            Outgoing::Service {
                request,
                local_id,
                conversation_id,
            } => {
                let service = sess.service.clone();
                self.spawn_internal(async move {
                    let result = service.send_message(request).await;
                    InternalEvent::SendCompleted {
                        epoch,
                        surface: surface_id,
                        local_id,
                        conversation_id: Some(conversation_id),
                        result,
                    }
                });
            }
        }
    }

    pub(super) fn finish_send(
        &mut self,
        surface: SurfaceId,
        local_id: String,
        conversation_id: Option<ConversationId>,
        result: Result<Message, ApiError>,
    ) {
        match result {
            Ok(message) => {
                if let Some(temp_id) = conversation_id.filter(ConversationId::is_temporary) {
                    if message.conversation_id != temp_id {
                        self.promote_conversation(&temp_id, &message.conversation_id);
                    }
                }
                let origin = self.resolve_surface(&surface);
                match self.surface_mut(&origin) {
                    Some(s) => {
                        s.reconciler.reconcile_confirmed(&local_id, message.clone());
                    }
                    None => tracing::debug!(surface = ?origin, "send confirmed after surface closed"),
                }
                // Other surfaces on the same conversation pick it up from the bus.
                self.bus.publish(ChatEvent::MessageSent { origin, message });
            }
            Err(e) => {
                tracing::warn!(surface = ?surface, error = %e, "send failed");
                let origin = self.resolve_surface(&surface);
                let Some(s) = self.surface_mut(&origin) else {
                    self.toast(format!("Message not sent: {}", e.user_visible_message()));
                    return;
                };
                s.send_error = Some(e.user_visible_message());
                if let Some(draft) = s.reconciler.rollback(&local_id) {
                    s.restored_draft = Some(draft.text.clone());
                    self.emit_draft_restored(origin, draft.text);
                }
            }
        }
    }

    /// The server created the conversation behind `temp_id`; rekey every
    /// surface and window and tell the rest of the bus.
    fn promote_conversation(&mut self, temp_id: &ConversationId, conversation_id: &ConversationId) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.renamed.contains_key(temp_id) {
            return;
        }
        tracing::info!(%temp_id, %conversation_id, "conversation created");
        sess.renamed.insert(temp_id.clone(), conversation_id.clone());
        sess.temp_peers.remove(temp_id);

        let stale: Vec<SurfaceId> = sess
            .surfaces
            .keys()
            .filter(|id| &id.renamed(temp_id, conversation_id) != *id)
            .cloned()
            .collect();
        for old in stale {
            let Some(mut surface) = sess.surfaces.remove(&old) else {
                continue;
            };
            let new = old.renamed(temp_id, conversation_id);
            if sess.surfaces.contains_key(&new) {
                // The real conversation is already open there.
                continue;
            }
            surface.reconciler.rename_conversation(temp_id, conversation_id);
            sess.surfaces.insert(new, surface);
        }
        if let Some(page) = sess.surfaces.get_mut(&SurfaceId::ChatPage) {
            page.reconciler.rename_conversation(temp_id, conversation_id);
        }
        sess.windows.rename(temp_id, conversation_id);

        self.bus.publish(ChatEvent::ConversationCreated {
            temp_id: temp_id.clone(),
            conversation_id: conversation_id.clone(),
        });
    }

    pub(super) fn finish_assistant_reply(
        &mut self,
        surface: SurfaceId,
        result: Result<String, ApiError>,
    ) {
        let Some(s) = self.surface_mut(&surface) else {
            tracing::debug!(surface = ?surface, "assistant reply for closed window dropped");
            return;
        };
        match result {
            Ok(text) => {
                s.reconciler
                    .append_local(UserId::new(ASSISTANT_AUTHOR), &Draft::text(text));
            }
            Err(e) => s.send_error = Some(e.user_visible_message()),
        }
    }

    pub(super) fn delete_message(&mut self, surface: SurfaceId, message_id: String) {
        let epoch = self.epoch;
        let surface_id = self.resolve_surface(&surface);
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let Some(s) = sess.surfaces.get_mut(&surface_id) else {
            return;
        };
        let Some(conversation_id) = s.reconciler.target().conversation_id().cloned() else {
            // Assistant messages never reach the service.
            s.reconciler.mark_deleted(&message_id);
            return;
        };
        let known = s
            .reconciler
            .messages()
            .iter()
            .any(|m| m.server_id() == Some(message_id.as_str()) && !m.is_deleted());
        if !known {
            tracing::debug!(%message_id, "delete ignored: not a delivered message");
            return;
        }
        let is_latest = s.reconciler.is_latest(&message_id);
        let service = sess.service.clone();
        self.spawn_internal(async move {
            let result = service.delete_message(&message_id).await;
            InternalEvent::DeleteCompleted {
                epoch,
                surface: surface_id,
                conversation_id,
                message_id,
                is_latest,
                result,
            }
        });
    }

    pub(super) fn finish_delete(
        &mut self,
        surface: SurfaceId,
        conversation_id: ConversationId,
        message_id: String,
        is_latest: bool,
        result: Result<(), ApiError>,
    ) {
        match result {
            Ok(()) => {
                let conversation_id = self
                    .session
                    .as_ref()
                    .and_then(|sess| sess.renamed.get(&conversation_id).cloned())
                    .unwrap_or(conversation_id);
                // Every surface, the originator included, applies it from the bus.
                self.bus.publish(ChatEvent::MessageDeleted(DeletionNotice {
                    conversation_id,
                    message_id,
                    is_latest,
                }));
            }
            Err(e) => {
                tracing::warn!(%message_id, error = %e, "delete failed");
                if let Some(s) = self.surface_mut(&surface) {
                    s.send_error = Some(format!("Delete failed: {}", e.user_visible_message()));
                }
            }
        }
    }
}
