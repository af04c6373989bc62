//! The single WebSocket connection of a session.
//!
//! `Transport` never blocks its caller and never returns connection errors
//! synchronously: everything is reported through the sink as a
//! [`TransportEvent`].

mod backoff;
pub mod frame;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::state::UserId;

pub use backoff::{Backoff, ReconnectPolicy, ReconnectStep};
pub use frame::{parse_frame, Inbound};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String, will_retry: bool },
    Reconnecting { attempt: u32, delay_ms: u64 },
    CircuitOpen { failures: u32, cooldown_ms: u64 },
    Error { message: String },
    Frame(Inbound),
}

pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Waiting,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub ws_url: String,
    pub viewer_id: UserId,
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
}

impl TransportConfig {
    /// The endpoint is keyed by user: one connection per viewer.
    pub fn endpoint(&self) -> Result<reqwest::Url, TransportError> {
        let mut url = reqwest::Url::parse(&self.ws_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", self.ws_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                self.ws_url
            )));
        }
        url.query_pairs_mut()
            .append_pair("userId", self.viewer_id.as_str());
        Ok(url)
    }
}

#[derive(Default)]
struct TaskControl {
    stopped: AtomicBool,
    wake: Notify,
}

impl TaskControl {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

struct Shared {
    state: RwLock<LinkState>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn set_state(&self, next: LinkState) {
        match self.state.write() {
            Ok(mut g) => *g = next,
            Err(poison) => *poison.into_inner() = next,
        }
    }

    fn state(&self) -> LinkState {
        match self.state.read() {
            Ok(g) => *g,
            Err(poison) => *poison.into_inner(),
        }
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        match self.outgoing.write() {
            Ok(mut g) => *g = tx,
            Err(poison) => *poison.into_inner() = tx,
        }
    }

    fn outgoing(&self) -> Option<mpsc::UnboundedSender<String>> {
        match self.outgoing.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }
}

pub struct Transport {
    config: TransportConfig,
    runtime: tokio::runtime::Handle,
    sink: TransportSink,
    shared: Arc<Shared>,
    control: Mutex<Option<Arc<TaskControl>>>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        runtime: tokio::runtime::Handle,
        sink: TransportSink,
    ) -> Self {
        Self {
            config,
            runtime,
            sink,
            shared: Arc::new(Shared {
                state: RwLock::new(LinkState::Idle),
                outgoing: RwLock::new(None),
            }),
            control: Mutex::new(None),
        }
    }

    /// Start the connection task. Returns false (and does nothing) when one
    /// is already running.
    pub fn connect(&self) -> bool {
        let mut slot = match self.control.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        if slot.as_ref().is_some_and(|c| !c.is_stopped()) {
            tracing::debug!("transport already running; connect ignored");
            return false;
        }
        let control = Arc::new(TaskControl::default());
        *slot = Some(control.clone());
        self.shared.set_state(LinkState::Connecting);

        let config = self.config.clone();
        let shared = self.shared.clone();
        let sink = self.sink.clone();
        self.runtime
            .spawn(run_connection(config, control, shared, sink));
        true
    }

    /// Write one frame if the socket is open. No buffering: a closed
    /// transport drops the frame and returns false.
    pub fn send<T: Serialize>(&self, frame: &T) -> bool {
        if self.shared.state() != LinkState::Open {
            return false;
        }
        let Some(tx) = self.shared.outgoing() else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => tx.send(text).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "outbound frame not serializable");
                false
            }
        }
    }

    /// Intentional close. No reconnect is scheduled afterwards.
    pub fn disconnect(&self) {
        let slot = match self.control.lock() {
            Ok(mut g) => g.take(),
            Err(poison) => poison.into_inner().take(),
        };
        if let Some(control) = slot {
            control.stop();
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn open_socket(config: &TransportConfig) -> Result<Socket, TransportError> {
    let url = config.endpoint()?;
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::InvalidHeader)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

async fn run_connection(
    config: TransportConfig,
    control: Arc<TaskControl>,
    shared: Arc<Shared>,
    sink: TransportSink,
) {
    let mut backoff = Backoff::new(config.policy.clone());
    tracing::info!(viewer = %config.viewer_id, url = %config.ws_url, "transport starting");

    while !control.is_stopped() {
        shared.set_state(LinkState::Connecting);
        match open_socket(&config).await {
            Ok(socket) => {
                if control.is_stopped() {
                    break;
                }
                backoff.reset();
                let reason = pump_socket(socket, &control, &shared, &sink).await;
                let will_retry = !control.is_stopped();
                tracing::info!(%reason, will_retry, "transport closed");
                sink(TransportEvent::Disconnected { reason, will_retry });
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport connect failed");
                sink(TransportEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        if control.is_stopped() {
            break;
        }

        shared.set_state(LinkState::Waiting);
        let wait = match backoff.next_step() {
            ReconnectStep::Retry { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                sink(TransportEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                delay
            }
            ReconnectStep::CircuitOpen { failures, cooldown } => {
                tracing::warn!(failures, cooldown_ms = cooldown.as_millis() as u64, "reconnect circuit open");
                sink(TransportEvent::CircuitOpen {
                    failures,
                    cooldown_ms: cooldown.as_millis() as u64,
                });
                cooldown
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = control.wake.notified() => {}
        }
    }

    shared.set_outgoing(None);
    shared.set_state(LinkState::Idle);
    tracing::info!("transport stopped");
}

/// Runs one open connection until it closes; returns the close reason.
async fn pump_socket(
    socket: Socket,
    control: &TaskControl,
    shared: &Shared,
    sink: &TransportSink,
) -> String {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    shared.set_outgoing(Some(tx));
    shared.set_state(LinkState::Open);
    sink(TransportEvent::Connected);

    let reason = loop {
        tokio::select! {
            _ = control.wake.notified() => {
                let _ = write.send(WsMessage::Close(None)).await;
                break "disconnect requested".to_string();
            }
            out = rx.recv() => {
                let Some(text) = out else {
                    break "outgoing channel closed".to_string();
                };
                if let Err(e) = write.send(WsMessage::text(text)).await {
                    break format!("write failed: {e}");
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => sink(TransportEvent::Frame(parse_frame(text.as_str()))),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    sink(TransportEvent::Frame(Inbound::Opaque(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    )));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server: {} {}", f.code, f.reason.as_str()))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read failed: {e}"),
                None => break "stream ended".to_string(),
            },
        }
    };

    shared.set_outgoing(None);
    shared.set_state(LinkState::Waiting);
    reason
}
