//! Integration tests: the chat socket session manager against a scripted upstream, both
//! directly and through the gateway's socket proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use oncochat::chat::{
    ChatController, ChatSession, ConversationState, InboundFrame, MessageId, ResponseKind,
};
use oncochat::client::ws::{CONNECTION_FAILED, NORMAL_CLOSURE};
use oncochat::client::{
    AuthTokenProvider, CloseReason, ConnectionState, RetryPolicy, SessionEvent,
    WebSocketSessionManager,
};
use oncochat::config::{Config, Environment};
use oncochat::gateway::{self, GatewayState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::{http, Message as WireMessage};

#[derive(Clone)]
enum Behavior {
    /// Send these text frames, then record everything the client sends.
    Script(Vec<String>),
    /// Accept TCP and hang up before the handshake.
    DropTcp,
    /// Complete the handshake, then close with 1000.
    CloseNormal,
    /// Refuse the handshake with this HTTP status.
    Reject(u16),
    /// Accept TCP and never answer the handshake.
    Stall,
}

struct FakeUpstream {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    uris: mpsc::UnboundedReceiver<String>,
    received: mpsc::UnboundedReceiver<WireMessage>,
}

async fn fake_upstream(behavior: Behavior) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local_addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let (uri_tx, uris) = mpsc::unbounded_channel();
    let (recv_tx, received) = mpsc::unbounded_channel();
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_one(
                stream,
                behavior.clone(),
                uri_tx.clone(),
                recv_tx.clone(),
            ));
        }
    });
    FakeUpstream {
        addr,
        accepted,
        uris,
        received,
    }
}

async fn serve_one(
    stream: TcpStream,
    behavior: Behavior,
    uri_tx: mpsc::UnboundedSender<String>,
    recv_tx: mpsc::UnboundedSender<WireMessage>,
) {
    match behavior {
        Behavior::DropTcp => {
            drop(stream);
            return;
        }
        Behavior::Stall => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
            return;
        }
        _ => {}
    }
    let reject = match behavior {
        Behavior::Reject(status) => Some(status),
        _ => None,
    };
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let _ = uri_tx.send(req.uri().to_string());
        match reject {
            Some(status) => Err(http::Response::builder()
                .status(status)
                .body(Some("rejected".to_string()))
                .unwrap()),
            None => Ok(resp),
        }
    };
    let Ok(mut socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    match behavior {
        Behavior::CloseNormal => {
            let _ = socket
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "done".into(),
                }))
                .await;
        }
        Behavior::Script(frames) => {
            for frame in frames {
                if socket.send(WireMessage::Text(frame)).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(msg)) = socket.next().await {
                let _ = recv_tx.send(msg);
            }
        }
        Behavior::DropTcp | Behavior::Reject(_) | Behavior::Stall => {}
    }
}

fn dev_auth(token: &str) -> Arc<AuthTokenProvider> {
    Arc::new(AuthTokenProvider::new(
        Environment::Development,
        std::env::temp_dir().join(format!("oncochat-session-{}", uuid::Uuid::new_v4())),
        Some(token.to_string()),
    ))
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(20),
        settle_delay: Duration::from_millis(0),
        handshake_timeout: Duration::from_secs(2),
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    want: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = rx.borrow_and_update().clone();
            if want(&state) {
                return state;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("connection state not reached within 5s")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no session event within 5s")
        .expect("event channel closed")
}

async fn spawn_gateway(upstream: SocketAddr) -> SocketAddr {
    let mut config = Config::default();
    config.gateway.upstream.api_base = format!("http://{}", upstream);
    let app = gateway::router(GatewayState::new(config).expect("gateway state"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn streamed_reply_through_gateway_is_reconstructed() {
    let mut upstream = fake_upstream(Behavior::Script(vec![
        json!({"type": "connection_established", "chat_state": {"conversation_state": "ACTIVE"}})
            .to_string(),
        json!({"type": "message_chunk", "message_id": 42, "content": "Sorry to "}).to_string(),
        json!({"type": "message_chunk", "message_id": 42, "content": "hear that."}).to_string(),
        json!({"type": "message_end", "message_id": 42}).to_string(),
    ]))
    .await;
    let gateway_addr = spawn_gateway(upstream.addr).await;

    let (mut manager, mut events) = WebSocketSessionManager::new(
        "/api",
        format!("http://{}", gateway_addr),
        dev_auth("tok"),
        quick_policy(),
    );
    let mut state = manager.subscribe_state();
    manager.set_session(Some("abc-123")).await;

    let mut controller = ChatController::new(ChatSession {
        chat_uuid: "abc-123".to_string(),
        conversation_state: ConversationState::Active,
        messages: Vec::new(),
    });
    loop {
        match next_event(&mut events).await {
            SessionEvent::Frame(frame) => {
                let done = matches!(frame, InboundFrame::MessageEnd { .. });
                controller.apply_frame(frame);
                if done {
                    break;
                }
            }
            SessionEvent::Error(e) => panic!("unexpected session error: {}", e),
        }
    }
    let reply = controller.messages().last().expect("assistant message");
    assert_eq!(reply.id, MessageId::Confirmed(42));
    assert_eq!(reply.content, "Sorry to hear that.");
    assert!(!controller.is_thinking());

    let uri = upstream.uris.recv().await.expect("upstream handshake");
    assert_eq!(uri, "/chat/ws/abc-123?token=tok");

    wait_for_state(&mut state, ConnectionState::is_open).await;
    assert!(manager.send("Not great", ResponseKind::Text));
    let sent = upstream.received.recv().await.expect("client frame");
    let WireMessage::Text(text) = sent else {
        panic!("expected a text frame, got {:?}", sent);
    };
    let sent: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        sent,
        json!({"type": "user_message", "message_type": "text", "content": "Not great"})
    );

    manager.teardown().await;
    assert_eq!(manager.state(), ConnectionState::Idle);
    match upstream.received.recv().await {
        Some(WireMessage::Close(Some(frame))) => assert_eq!(u16::from(frame.code), NORMAL_CLOSURE),
        other => panic!("expected a normal close, got {:?}", other),
    }
    assert!(!manager.send("too late", ResponseKind::Text));
}

#[tokio::test]
async fn abnormal_failures_retry_then_give_up() {
    let upstream = fake_upstream(Behavior::DropTcp).await;
    let (mut manager, mut events) = WebSocketSessionManager::new(
        format!("http://{}", upstream.addr),
        "http://unused",
        dev_auth("tok"),
        quick_policy(),
    );
    let mut state = manager.subscribe_state();
    manager.set_session(Some("abc")).await;

    let last = wait_for_state(&mut state, |s| {
        matches!(s, ConnectionState::Closed(CloseReason::RetriesExhausted))
    })
    .await;
    assert_eq!(last, ConnectionState::Closed(CloseReason::RetriesExhausted));
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 4);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Error(CONNECTION_FAILED.to_string()) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn stalled_handshakes_time_out_and_retry() {
    let upstream = fake_upstream(Behavior::Stall).await;
    let policy = RetryPolicy {
        handshake_timeout: Duration::from_millis(50),
        ..quick_policy()
    };
    let (mut manager, mut events) = WebSocketSessionManager::new(
        format!("http://{}", upstream.addr),
        "http://unused",
        dev_auth("tok"),
        policy,
    );
    let mut state = manager.subscribe_state();
    manager.set_session(Some("abc")).await;

    let last = wait_for_state(&mut state, |s| {
        matches!(s, ConnectionState::Closed(CloseReason::RetriesExhausted))
    })
    .await;
    assert_eq!(last, ConnectionState::Closed(CloseReason::RetriesExhausted));
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 4);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Error(CONNECTION_FAILED.to_string()) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn gateway_answers_502_when_upstream_handshake_stalls() {
    let upstream = fake_upstream(Behavior::Stall).await;
    let mut config = Config::default();
    config.gateway.upstream.api_base = format!("http://{}", upstream.addr);
    config.gateway.upstream.timeout_secs = 1;
    let app = gateway::router(GatewayState::new(config).expect("gateway state"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let url = format!("ws://{}/api/chat/ws/abc?token=tok", addr);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::connect_async(url),
    )
    .await
    .expect("gateway did not answer within 5s");
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), http::StatusCode::BAD_GATEWAY);
        }
        other => panic!("expected 502, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn normal_close_is_not_retried() {
    let upstream = fake_upstream(Behavior::CloseNormal).await;
    let (mut manager, _events) = WebSocketSessionManager::new(
        format!("http://{}", upstream.addr),
        "http://unused",
        dev_auth("tok"),
        quick_policy(),
    );
    let mut state = manager.subscribe_state();
    manager.set_session(Some("abc")).await;

    wait_for_state(&mut state, |s| {
        matches!(s, ConnectionState::Closed(CloseReason::Normal))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.state(),
        ConnectionState::Closed(CloseReason::Normal)
    );
}

#[tokio::test]
async fn rejected_handshake_is_terminal() {
    let upstream = fake_upstream(Behavior::Reject(401)).await;
    let (mut manager, mut events) = WebSocketSessionManager::new(
        format!("http://{}", upstream.addr),
        "http://unused",
        dev_auth("tok"),
        quick_policy(),
    );
    let mut state = manager.subscribe_state();
    manager.set_session(Some("abc")).await;

    let last = wait_for_state(&mut state, |s| matches!(s, ConnectionState::Closed(_))).await;
    assert_eq!(
        last,
        ConnectionState::Closed(CloseReason::Unauthorized { status: 401 })
    );
    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn switching_sessions_replaces_the_socket() {
    let mut upstream = fake_upstream(Behavior::Script(Vec::new())).await;
    let (mut manager, _events) = WebSocketSessionManager::new(
        format!("http://{}", upstream.addr),
        "http://unused",
        dev_auth("tok"),
        quick_policy(),
    );
    let mut state = manager.subscribe_state();

    manager.set_session(Some("first")).await;
    wait_for_state(&mut state, ConnectionState::is_open).await;
    manager.set_session(Some("first")).await;
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 1);

    manager.set_session(Some("second")).await;
    assert_eq!(manager.chat_uuid(), Some("second"));
    match upstream.received.recv().await {
        Some(WireMessage::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected the first socket to close normally, got {:?}", other),
    }
    wait_for_state(&mut state, ConnectionState::is_open).await;
    assert_eq!(upstream.uris.recv().await.as_deref(), Some("/chat/ws/first?token=tok"));
    assert_eq!(upstream.uris.recv().await.as_deref(), Some("/chat/ws/second?token=tok"));
}
