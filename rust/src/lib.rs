mod actions;
pub mod api;
pub mod bus;
mod core;
pub mod directory;
pub mod error;
mod logging;
pub mod reconciler;
mod state;
pub mod transport;
mod updates;
pub mod windows;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use api::{AssistantBridge, ChatService, SharedChatService, UnavailableAssistant};
pub use async_trait::async_trait;
pub use bus::{ChatEvent, EventBus, Topic};
pub use error::ApiError;
pub use logging::init_logging;
pub use state::*;
pub use updates::*;
pub use windows::WindowRequest;

/// Return the default `forum_chat_config.json` payload used when no config file exists.
pub fn default_config_json() -> String {
    core::default_app_config_json()
}

/// File name of the config the core reads from its data directory.
pub fn config_file_name() -> &'static str {
    core::CONFIG_FILE_NAME
}

pub trait AppUpdateListener: Send + Sync + 'static {
    fn on_update(&self, update: AppUpdate);
}

pub struct ChatApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    bus: EventBus,
}

impl ChatApp {
    /// An app talking to the configured HTTP service, without an assistant.
    pub fn new(data_dir: String) -> Arc<Self> {
        Self::with_services(data_dir, None, Arc::new(UnavailableAssistant))
    }

    /// `service` replaces the HTTP client for every session when set.
    pub fn with_services(
        data_dir: String,
        service: Option<SharedChatService>,
        assistant: Arc<dyn AssistantBridge>,
    ) -> Arc<Self> {
        logging::init_logging();
        tracing::info!(data_dir = %data_dir, "ChatApp::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));
        let (bus_tx, bus_rx) = flume::bounded::<EventBus>(1);

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::ChatCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                service,
                assistant,
            );
            let _ = bus_tx.send(core.bus().clone());
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
                if core.is_shut_down() {
                    break;
                }
            }
        });

        // The bus is created on the actor thread; wait for its handle. If the
        // actor died during startup, hand out a bus that is already closed.
        let bus = bus_rx.recv().unwrap_or_else(|_| {
            let bus = EventBus::new();
            bus.shutdown();
            bus
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
            bus,
        })
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, listener: Box<dyn AppUpdateListener>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                listener.on_update(update);
            }
        });
    }

    /// The process-wide event bus. Outside code may publish window requests
    /// or subscribe to anything the core publishes.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Stop the session, drop every bus subscriber and end the actor thread.
    pub fn shutdown(&self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
    }
}

impl ChatApp {
    /// Feed a raw WebSocket text frame through the same path live frames take.
    pub fn inject_frame_for_tests(&self, raw: impl Into<String>) {
        let _ = self.core_tx.send(CoreMsg::Internal(Box::new(
            InternalEvent::InjectedFrame { raw: raw.into() },
        )));
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
    }
}
