use std::sync::{Arc, Mutex};
use std::time::Duration;

use forum_chat_core::transport::{
    Inbound, LinkState, ReconnectPolicy, Transport, TransportConfig, TransportEvent,
};
use forum_chat_core::{ConversationId, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        ..ReconnectPolicy::default()
    }
}

fn start(
    ws_url: String,
    token: Option<&str>,
    policy: ReconnectPolicy,
) -> (Transport, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Transport::new(
        TransportConfig {
            ws_url,
            viewer_id: UserId::new("user-a"),
            token: token.map(str::to_string),
            policy,
        },
        tokio::runtime::Handle::current(),
        Arc::new(move |event: TransportEvent| {
            let _ = tx.send(event);
        }),
    );
    (transport, rx)
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    what: &str,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

async fn wait_for_state(transport: &Transport, want: LinkState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while transport.state() != want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "transport never reached {want:?}, still {:?}",
            transport.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn accept(listener: &TcpListener) -> tokio_tungstenite::WebSocketStream<TcpStream> {
    let (tcp, _) = listener.accept().await.expect("accept tcp");
    tokio_tungstenite::accept_async(tcp)
        .await
        .expect("websocket handshake")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alias_frames_are_normalized_and_binary_frames_kept_opaque() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seen: Arc<Mutex<Option<(String, Option<String>)>>> = Arc::new(Mutex::new(None));
    let seen_by_server = seen.clone();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            *seen_by_server.lock().unwrap() = Some((req.uri().to_string(), auth));
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, record)
            .await
            .unwrap();
        let frame = serde_json::json!({
            "_id": "m9",
            "chatId": "c1",
            "senderId": "user-b",
            "content": "hello",
            "messageType": "text",
            "sentAt": 1_700_000_000_000i64,
        });
        ws.send(Message::text(frame.to_string())).await.unwrap();
        ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let _ = outbound_tx.send(text.as_str().to_string());
            }
        }
    });

    let (transport, mut rx) = start(format!("ws://{addr}/ws"), Some("secret"), fast_policy());
    assert!(transport.connect());
    assert!(!transport.connect(), "second connect is ignored while running");

    wait_for(&mut rx, "connected", |e| *e == TransportEvent::Connected).await;
    let message = wait_for(&mut rx, "message frame", |e| {
        matches!(e, TransportEvent::Frame(Inbound::Message(_)))
    })
    .await;
    let TransportEvent::Frame(Inbound::Message(envelope)) = message else {
        unreachable!()
    };
    assert_eq!(envelope.id.as_deref(), Some("m9"));
    assert_eq!(envelope.conversation_id, ConversationId::new("c1"));
    assert_eq!(envelope.from_user_id, UserId::new("user-b"));
    assert_eq!(envelope.message, "hello");
    assert_eq!(envelope.created_at.timestamp_millis(), 1_700_000_000_000);

    wait_for(&mut rx, "opaque frame", |e| {
        matches!(e, TransportEvent::Frame(Inbound::Opaque(_)))
    })
    .await;

    let (uri, auth) = seen.lock().unwrap().clone().expect("handshake recorded");
    assert_eq!(uri, "/ws?userId=user-a");
    assert_eq!(auth.as_deref(), Some("Bearer secret"));

    assert!(transport.is_open());
    assert!(transport.send(&serde_json::json!({ "type": "typing", "chatId": "c1" })));
    let got = tokio::time::timeout(WAIT, outbound_rx.recv())
        .await
        .expect("server got the frame")
        .unwrap();
    let got: serde_json::Value = serde_json::from_str(&got).unwrap();
    assert_eq!(got["type"], "typing");

    transport.disconnect();
    let closed = wait_for(&mut rx, "disconnected", |e| {
        matches!(e, TransportEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        closed,
        TransportEvent::Disconnected {
            reason: "disconnect requested".into(),
            will_retry: false,
        }
    );
    wait_for_state(&transport, LinkState::Idle).await;
    assert!(!transport.send(&serde_json::json!({ "type": "typing" })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_schedules_a_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut first = accept(&listener).await;
        first.close(None).await.unwrap();
        // Drain until the client acknowledges the close.
        while let Some(Ok(_)) = first.next().await {}

        let mut second = accept(&listener).await;
        let frame = serde_json::json!({
            "id": "m2",
            "conversationId": "c1",
            "fromUserId": "user-b",
            "message": "back again",
        });
        second.send(Message::text(frame.to_string())).await.unwrap();
        while let Some(Ok(_)) = second.next().await {}
    });

    let (transport, mut rx) = start(format!("ws://{addr}/ws"), None, fast_policy());
    transport.connect();

    wait_for(&mut rx, "first connect", |e| *e == TransportEvent::Connected).await;
    let dropped = wait_for(&mut rx, "disconnect", |e| {
        matches!(e, TransportEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(
        dropped,
        TransportEvent::Disconnected {
            will_retry: true,
            ..
        }
    ));
    let retry = wait_for(&mut rx, "reconnecting", |e| {
        matches!(e, TransportEvent::Reconnecting { .. })
    })
    .await;
    assert_eq!(
        retry,
        TransportEvent::Reconnecting {
            attempt: 1,
            delay_ms: 20,
        }
    );
    wait_for(&mut rx, "second connect", |e| *e == TransportEvent::Connected).await;
    wait_for(&mut rx, "frame after reconnect", |e| {
        matches!(e, TransportEvent::Frame(Inbound::Message(env)) if env.message == "back again")
    })
    .await;

    transport.disconnect();
    wait_for_state(&transport, LinkState::Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_failures_open_the_circuit_and_disconnect_stops_retrying() {
    // Reserve a port, then free it so every connect attempt is refused.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (transport, mut rx) = start(
        format!("ws://{addr}/ws"),
        None,
        ReconnectPolicy {
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            ..fast_policy()
        },
    );
    transport.connect();

    wait_for(&mut rx, "connect error", |e| {
        matches!(e, TransportEvent::Error { .. })
    })
    .await;
    let open = wait_for(&mut rx, "circuit open", |e| {
        matches!(e, TransportEvent::CircuitOpen { .. })
    })
    .await;
    assert_eq!(
        open,
        TransportEvent::CircuitOpen {
            failures: 3,
            cooldown_ms: 30_000,
        }
    );
    assert_eq!(transport.state(), LinkState::Waiting);

    // Disconnect interrupts the cooldown instead of waiting it out.
    transport.disconnect();
    wait_for_state(&transport, LinkState::Idle).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(
                event,
                TransportEvent::Connected | TransportEvent::Reconnecting { .. }
            ),
            "no attempts after disconnect, got {event:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_url_is_reported_as_an_error() {
    let (transport, mut rx) = start("http://127.0.0.1:1/ws".into(), None, fast_policy());
    transport.connect();
    let event = wait_for(&mut rx, "error", |e| matches!(e, TransportEvent::Error { .. })).await;
    let TransportEvent::Error { message } = event else {
        unreachable!()
    };
    assert!(message.contains("scheme must be ws or wss"), "{message}");
    transport.disconnect();
    wait_for_state(&transport, LinkState::Idle).await;
}
