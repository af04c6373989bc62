// Session lifecycle, the transport connection and conversation-level calls.

use std::sync::Arc;

use anyhow::Context;

use super::*;
use crate::api::HttpChatService;
use crate::bus::ConnectionEvent;
use crate::error::ApiError;
use crate::state::{Conversation, ConnectionStatus};
use crate::transport::{Inbound, TransportConfig, TransportEvent, TransportSink};

impl ChatCore {
    pub(super) fn start_session(
        &mut self,
        viewer_id: &str,
        token: Option<String>,
    ) -> anyhow::Result<()> {
        // Tear down any existing session first.
        self.stop_session();

        let viewer_id = viewer_id.trim();
        anyhow::ensure!(!viewer_id.is_empty(), "missing user id");
        let viewer = UserId::new(viewer_id);
        tracing::info!(viewer = %viewer, "start_session");

        let service: SharedChatService = match &self.service_override {
            Some(service) => service.clone(),
            None => Arc::new(
                HttpChatService::new(
                    self.config.api_base_url(),
                    token.clone(),
                    self.config.request_timeout(),
                )
                .context("create chat service")?,
            ),
        };

        let transport = if self.network_enabled() {
            let transport = Transport::new(
                TransportConfig {
                    ws_url: self.config.ws_url().to_string(),
                    viewer_id: viewer.clone(),
                    token,
                    policy: self.config.reconnect_policy(),
                },
                self.runtime.handle().clone(),
                self.transport_sink(),
            );
            transport.connect();
            self.state.connection = ConnectionStatus::Connecting;
            Some(transport)
        } else {
            tracing::info!("network disabled; no websocket");
            self.state.connection = ConnectionStatus::Offline;
            None
        };

        self.session = Some(Session {
            directory: ConversationDirectory::mount(&self.bus, viewer.clone()),
            windows: WindowManager::mount(&self.bus, self.config.max_mini_windows()),
            viewer,
            service,
            transport,
            surfaces: HashMap::new(),
            focused: BTreeSet::new(),
            temp_peers: HashMap::new(),
            renamed: HashMap::new(),
        });

        self.start_refresh();
        Ok(())
    }

    pub(super) fn stop_session(&mut self) {
        // Invalidate every in-flight call of the old session.
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(sess) = self.session.take() {
            tracing::info!(viewer = %sess.viewer, "stop_session");
            if let Some(transport) = sess.transport.as_ref() {
                transport.disconnect();
            }
            // Dropping the session drops every mailbox, which unsubscribes
            // the directory, the windows and all surfaces.
        }
        self.state.connection = ConnectionStatus::Offline;
    }

    fn transport_sink(&self) -> TransportSink {
        let tx = self.core_sender.clone();
        let epoch = self.epoch;
        Arc::new(move |event: TransportEvent| {
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Transport {
                epoch,
                event,
            })));
        })
    }

    pub(super) fn start_refresh(&mut self) {
        let epoch = self.epoch;
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let ticket = sess.directory.begin_refresh();
        let service = sess.service.clone();
        self.spawn_internal(async move {
            let result = service.conversations().await;
            InternalEvent::ConversationsLoaded {
                epoch,
                ticket,
                result,
            }
        });
    }

    pub(super) fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                tracing::info!("transport connected");
                self.state.connection = ConnectionStatus::Connected;
                self.bus
                    .publish(ChatEvent::Connection(ConnectionEvent::Connected));
                // Catch up on anything missed while disconnected.
                self.start_refresh();
            }
            TransportEvent::Disconnected { reason, will_retry } => {
                self.state.connection = if will_retry {
                    ConnectionStatus::Reconnecting { attempt: 0 }
                } else {
                    ConnectionStatus::Offline
                };
                self.bus
                    .publish(ChatEvent::Connection(ConnectionEvent::Disconnected {
                        reason,
                        will_retry,
                    }));
            }
            TransportEvent::Reconnecting { attempt, .. } => {
                self.state.connection = ConnectionStatus::Reconnecting { attempt };
            }
            TransportEvent::CircuitOpen {
                failures,
                cooldown_ms,
            } => {
                self.state.connection = ConnectionStatus::CircuitOpen;
                self.bus
                    .publish(ChatEvent::Connection(ConnectionEvent::Error {
                        message: format!(
                            "{failures} failed connection attempts; retrying in {}s",
                            cooldown_ms / 1000
                        ),
                    }));
            }
            TransportEvent::Error { message } => {
                self.bus
                    .publish(ChatEvent::Connection(ConnectionEvent::Error { message }));
            }
            TransportEvent::Frame(inbound) => self.handle_inbound(inbound),
        }
    }

    pub(super) fn handle_inbound(&mut self, inbound: Inbound) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let viewer = sess.viewer.clone();
        match inbound {
            Inbound::Message(envelope) => {
                let read_now = sess.focused.contains(&envelope.conversation_id)
                    && envelope.from_user_id != viewer;
                let conversation_id = envelope.conversation_id.clone();
                self.bus.publish(ChatEvent::MessageReceived(envelope));
                if read_now {
                    self.request_mark_read(conversation_id);
                }
            }
            Inbound::Deleted(notice) => {
                self.bus.publish(ChatEvent::MessageDeleted(notice));
            }
            Inbound::MarkedRead {
                conversation_id,
                viewer_id,
            } => {
                self.bus.publish(ChatEvent::ConversationMarkedRead {
                    conversation_id,
                    viewer_id: viewer_id.unwrap_or(viewer),
                });
            }
            Inbound::Opaque(raw) => {
                tracing::debug!(len = raw.len(), "opaque frame");
                self.bus.publish(ChatEvent::OpaqueFrame { raw });
            }
        }
    }

    pub(super) fn request_mark_read(&mut self, conversation_id: ConversationId) {
        if conversation_id.is_temporary() {
            return;
        }
        let epoch = self.epoch;
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let service = sess.service.clone();
        self.spawn_internal(async move {
            let result = service.mark_as_read(&conversation_id).await;
            InternalEvent::MarkedRead {
                epoch,
                conversation_id,
                result,
            }
        });
    }

    pub(super) fn finish_mark_read(
        &mut self,
        conversation_id: ConversationId,
        result: Result<(), ApiError>,
    ) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        match result {
            Ok(()) => {
                let viewer_id = sess.viewer.clone();
                self.bus.publish(ChatEvent::ConversationMarkedRead {
                    conversation_id,
                    viewer_id,
                });
            }
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "mark as read failed");
            }
        }
    }

    pub(super) fn create_group(&mut self, name: String, member_ids: Vec<UserId>) {
        let name = name.trim().to_string();
        if name.is_empty() {
            self.toast("Enter a group name");
            return;
        }
        let epoch = self.epoch;
        let Some(sess) = self.session.as_ref() else {
            self.toast("Sign in to chat");
            return;
        };
        let service = sess.service.clone();
        self.spawn_internal(async move {
            let result = service.create_group(&name, &member_ids).await;
            InternalEvent::GroupCreated { epoch, result }
        });
    }

    pub(super) fn finish_create_group(&mut self, result: Result<Conversation, ApiError>) {
        match result {
            Ok(conversation) => {
                tracing::info!(conversation_id = %conversation.id, "group created");
                self.bus.publish(ChatEvent::ConversationUpdated {
                    conversation_id: Some(conversation.id.clone()),
                });
                self.bus
                    .publish(ChatEvent::WindowRequest(WindowRequest::OpenMiniChat {
                        conversation_id: conversation.id,
                    }));
            }
            Err(e) => self.toast(format!("Create group failed: {}", e.user_visible_message())),
        }
    }
}
