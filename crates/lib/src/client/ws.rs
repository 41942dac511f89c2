//! Chat socket session manager.
//!
//! `ConnectionMachine` holds the connection lifecycle and retry rules as plain transitions.
//! `WebSocketSessionManager` drives it from one tokio task per live socket and keeps at most one
//! such task: changing the session tears the previous one down (closing with 1000) before the
//! next starts. Inbound frames are forwarded as `SessionEvent`s; the manager keeps no messages.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::COOKIE, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message as WireMessage,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::auth::AuthTokenProvider;
use super::rest::resolve_api_base;
use crate::chat::{parse_inbound, InboundFrame, OutboundFrame, ResponseKind};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const AUTH_TOKEN_MISSING: &str = "Authentication token not found.";
pub const CONNECTION_FAILED: &str = "Connection failed. Please reload the chat.";
pub const CONNECTION_ERROR: &str = "WebSocket connection error";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Wait before the first connect so auth state can settle.
    pub settle_delay: Duration,
    /// A handshake that has not completed by then counts as an abnormal close.
    pub handshake_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: attempt × base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed with 1000; never retried.
    Normal,
    /// Abnormal close; a retry is pending.
    Abnormal { code: u16 },
    RetriesExhausted,
    AuthenticationMissing,
    /// Handshake refused with HTTP 401/403.
    Unauthorized { status: u16 },
    Misconfigured(String),
}

impl CloseReason {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Abnormal { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting { attempt: u32 },
    Open,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Reconnect { attempt: u32, delay: Duration },
    Stop(CloseReason),
}

/// Idle → Connecting → Open → Closed, with Closed either terminal or leading back to
/// Connecting after a backoff.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: RetryPolicy,
    state: ConnectionState,
    retries: u32,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            retries: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting {
            attempt: self.retries,
        };
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Open;
        self.retries = 0;
    }

    /// The socket closed (or never opened) with `code`.
    pub fn closed(&mut self, code: u16) -> NextStep {
        if code == NORMAL_CLOSURE {
            self.state = ConnectionState::Closed(CloseReason::Normal);
            return NextStep::Stop(CloseReason::Normal);
        }
        if self.retries < self.policy.max_retries {
            self.retries += 1;
            self.state = ConnectionState::Closed(CloseReason::Abnormal { code });
            return NextStep::Reconnect {
                attempt: self.retries,
                delay: self.policy.delay_for(self.retries),
            };
        }
        self.state = ConnectionState::Closed(CloseReason::RetriesExhausted);
        NextStep::Stop(CloseReason::RetriesExhausted)
    }

    /// Terminal failure that must not be retried (authentication, configuration).
    pub fn rejected(&mut self, reason: CloseReason) {
        self.state = ConnectionState::Closed(reason);
    }

    pub fn teardown(&mut self) {
        self.state = ConnectionState::Idle;
        self.retries = 0;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WsUrlError {
    #[error("unsupported API base scheme: {0}")]
    Scheme(String),
    #[error("invalid origin: {0}")]
    Origin(String),
    #[error("invalid socket url: {0}")]
    Invalid(String),
}

/// Socket URL for `chat_uuid`. An absolute REST base has its scheme swapped (http→ws,
/// https→wss); a relative base is taken as a path prefix on `origin`.
pub fn socket_url(
    api_base: &str,
    origin: &str,
    chat_uuid: &str,
    token: &str,
) -> Result<String, WsUrlError> {
    let api_base = api_base.trim().trim_end_matches('/');
    let base = if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if api_base.contains("://") {
        return Err(WsUrlError::Scheme(api_base.to_string()));
    } else {
        let origin = origin.trim().trim_end_matches('/');
        let (scheme, rest) = origin
            .split_once("://")
            .ok_or_else(|| WsUrlError::Origin(origin.to_string()))?;
        let ws_scheme = match scheme {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(WsUrlError::Origin(origin.to_string())),
        };
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(WsUrlError::Origin(origin.to_string()));
        }
        let prefix = match api_base {
            "" => String::new(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{}", p),
        };
        format!("{}://{}{}", ws_scheme, host, prefix)
    };
    let mut url = Url::parse(&format!("{}/chat/ws/{}", base, chat_uuid))
        .map_err(|e| WsUrlError::Invalid(e.to_string()))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

/// The URL with its `token` query value hidden, for logs.
pub fn redact_token(url: &str) -> String {
    let Some(start) = url.find("token=").map(|i| i + "token=".len()) else {
        return url.to_string();
    };
    let end = url[start..].find('&').map_or(url.len(), |i| start + i);
    format!("{}***{}", &url[..start], &url[end..])
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Frame(InboundFrame),
    Error(String),
}

struct ActiveConnection {
    chat_uuid: String,
    shutdown: oneshot::Sender<()>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    task: JoinHandle<()>,
}

pub struct WebSocketSessionManager {
    api_base: String,
    origin: String,
    auth: Arc<AuthTokenProvider>,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Option<ActiveConnection>,
}

impl WebSocketSessionManager {
    /// Returns the manager and the receiver for its events.
    pub fn new(
        api_base: impl Into<String>,
        origin: impl Into<String>,
        auth: Arc<AuthTokenProvider>,
        policy: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let manager = Self {
            api_base: api_base.into(),
            origin: origin.into(),
            auth,
            policy,
            events,
            state: Arc::new(state),
            active: None,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    pub fn chat_uuid(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.chat_uuid.as_str())
    }

    /// Bind the manager to `chat_uuid` (or to nothing). Any previous socket is closed with
    /// 1000 and its task awaited before a new one starts.
    pub async fn set_session(&mut self, chat_uuid: Option<&str>) {
        if let (Some(active), Some(uuid)) = (&self.active, chat_uuid) {
            if active.chat_uuid == uuid && !active.task.is_finished() {
                return;
            }
        }
        self.teardown().await;
        let Some(chat_uuid) = chat_uuid else {
            return;
        };

        let Some(token) = self.auth.websocket_token() else {
            log::error!("no auth token; not connecting chat {}", chat_uuid);
            self.fail(CloseReason::AuthenticationMissing, AUTH_TOKEN_MISSING);
            return;
        };
        let url = match socket_url(&self.api_base, &self.origin, chat_uuid, &token) {
            Ok(url) => url,
            Err(e) => {
                log::error!("cannot build socket url: {}", e);
                let message = e.to_string();
                self.fail(CloseReason::Misconfigured(message.clone()), &message);
                return;
            }
        };
        let cookie = Url::parse(&resolve_api_base(&self.api_base, &self.origin))
            .ok()
            .and_then(|rest_url| self.auth.cookie_header(&rest_url));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(ConnectionTask {
            url,
            cookie,
            policy: self.policy,
            events: self.events.clone(),
            state: self.state.clone(),
            shutdown: shutdown_rx,
            outbound: outbound_rx,
        }));
        self.active = Some(ActiveConnection {
            chat_uuid: chat_uuid.to_string(),
            shutdown,
            outbound,
            task,
        });
    }

    /// Cancel pending retries and close the socket normally; the retry path is not taken.
    pub async fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            log::debug!("tearing down chat socket for {}", active.chat_uuid);
            let _ = active.shutdown.send(());
            if let Err(e) = active.task.await {
                log::warn!("chat socket task ended abnormally: {}", e);
            }
        }
        self.state.send_replace(ConnectionState::Idle);
    }

    /// Send a user message. A logged no-op unless the socket is open.
    pub fn send(&self, content: &str, kind: ResponseKind) -> bool {
        self.send_frame(OutboundFrame::user_message(kind, content))
    }

    pub fn send_frame(&self, frame: OutboundFrame) -> bool {
        if !self.is_open() {
            log::error!("chat socket is not open; message not sent");
            return false;
        }
        match &self.active {
            Some(active) => active.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn fail(&self, reason: CloseReason, message: &str) {
        self.state.send_replace(ConnectionState::Closed(reason));
        let _ = self.events.send(SessionEvent::Error(message.to_string()));
    }
}

struct ConnectionTask {
    url: String,
    cookie: Option<String>,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: oneshot::Receiver<()>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

enum PumpEnd {
    Shutdown,
    Closed(u16),
}

async fn run_connection(mut task: ConnectionTask) {
    let mut machine = ConnectionMachine::new(task.policy);
    let redacted = redact_token(&task.url);

    if sleep_or_shutdown(task.policy.settle_delay, &mut task.shutdown).await {
        return;
    }
    loop {
        machine.connecting();
        task.state.send_replace(machine.state().clone());
        log::info!("connecting to {} (retries so far: {})", redacted, machine.retries());

        let request = match handshake_request(&task.url, task.cookie.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                log::error!("invalid socket request for {}: {}", redacted, e);
                machine.rejected(CloseReason::Misconfigured(e.to_string()));
                task.state.send_replace(machine.state().clone());
                let _ = task.events.send(SessionEvent::Error(e.to_string()));
                return;
            }
        };

        let dial = tokio::time::timeout(
            task.policy.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        );
        let connected = tokio::select! {
            result = dial => result,
            _ = &mut task.shutdown => return,
        };
        let code = match connected {
            Err(_) => {
                log::warn!(
                    "chat socket handshake timed out after {:?}",
                    task.policy.handshake_timeout
                );
                let _ = task.events.send(SessionEvent::Error(CONNECTION_ERROR.to_string()));
                ABNORMAL_CLOSURE
            }
            Ok(Ok((socket, _))) => {
                machine.opened();
                task.state.send_replace(machine.state().clone());
                log::info!("chat socket open: {}", redacted);
                match pump(socket, &mut task.shutdown, &mut task.outbound, &task.events).await {
                    PumpEnd::Shutdown => return,
                    PumpEnd::Closed(code) => code,
                }
            }
            Ok(Err(tungstenite::Error::Http(response)))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                let status = response.status().as_u16();
                log::error!("chat socket handshake rejected with {}", status);
                machine.rejected(CloseReason::Unauthorized { status });
                task.state.send_replace(machine.state().clone());
                let _ = task.events.send(SessionEvent::Error(format!(
                    "Authentication failed (HTTP {}). Please log in again.",
                    status
                )));
                return;
            }
            Ok(Err(e)) => {
                log::warn!("chat socket connect failed: {}", e);
                let _ = task.events.send(SessionEvent::Error(CONNECTION_ERROR.to_string()));
                ABNORMAL_CLOSURE
            }
        };

        let step = machine.closed(code);
        task.state.send_replace(machine.state().clone());
        match step {
            NextStep::Reconnect { attempt, delay } => {
                log::warn!(
                    "chat socket closed with {}; retry {}/{} in {:?}",
                    code,
                    attempt,
                    task.policy.max_retries,
                    delay
                );
                if sleep_or_shutdown(delay, &mut task.shutdown).await {
                    return;
                }
            }
            NextStep::Stop(CloseReason::Normal) => {
                log::info!("chat socket closed normally");
                return;
            }
            NextStep::Stop(reason) => {
                log::error!("chat socket giving up: {:?}", reason);
                let _ = task.events.send(SessionEvent::Error(CONNECTION_FAILED.to_string()));
                return;
            }
        }
    }
}

/// True when shutdown was requested (or the manager went away) before `delay` elapsed.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown => true,
    }
}

fn handshake_request(
    url: &str,
    cookie: Option<&str>,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(cookie) = cookie {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            request.headers_mut().insert(COOKIE, value);
        }
    }
    Ok(request)
}

async fn pump(
    socket: Socket,
    shutdown: &mut oneshot::Receiver<()>,
    outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> PumpEnd {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session closed".into(),
                };
                let _ = sink.send(WireMessage::Close(Some(close))).await;
                return PumpEnd::Shutdown;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return PumpEnd::Shutdown;
                };
                match frame.to_json() {
                    Ok(text) => {
                        if let Err(e) = sink.send(WireMessage::Text(text)).await {
                            log::warn!("chat socket write failed: {}", e);
                            return PumpEnd::Closed(ABNORMAL_CLOSURE);
                        }
                    }
                    Err(e) => log::error!("could not encode outbound frame: {}", e),
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(WireMessage::Text(text))) => dispatch(&text, events),
                Some(Ok(WireMessage::Close(frame))) => {
                    let code = frame.map_or(NO_STATUS_RECEIVED, |f| u16::from(f.code));
                    return PumpEnd::Closed(code);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("chat socket read failed: {}", e);
                    return PumpEnd::Closed(ABNORMAL_CLOSURE);
                }
                None => return PumpEnd::Closed(ABNORMAL_CLOSURE),
            },
        }
    }
}

fn dispatch(text: &str, events: &mpsc::UnboundedSender<SessionEvent>) {
    match parse_inbound(text) {
        Ok(InboundFrame::ConnectionEstablished { chat_state }) => {
            log::info!("chat connection established (state: {:?})", chat_state);
        }
        Ok(frame) => {
            let _ = events.send(SessionEvent::Frame(frame));
        }
        Err(e) => log::warn!("dropping malformed chat frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn abnormal_closes_retry_three_times_with_linear_backoff() {
        let mut m = ConnectionMachine::new(fast_policy());
        m.connecting();
        assert_eq!(m.state(), &ConnectionState::Connecting { attempt: 0 });
        for attempt in 1..=3 {
            assert_eq!(
                m.closed(ABNORMAL_CLOSURE),
                NextStep::Reconnect {
                    attempt,
                    delay: Duration::from_millis(1000 * attempt as u64)
                }
            );
            m.connecting();
        }
        assert_eq!(
            m.closed(ABNORMAL_CLOSURE),
            NextStep::Stop(CloseReason::RetriesExhausted)
        );
        assert_eq!(
            m.state(),
            &ConnectionState::Closed(CloseReason::RetriesExhausted)
        );
    }

    #[test]
    fn normal_close_never_retries() {
        let mut m = ConnectionMachine::new(fast_policy());
        m.connecting();
        m.opened();
        assert_eq!(m.closed(NORMAL_CLOSURE), NextStep::Stop(CloseReason::Normal));
        assert!(matches!(m.state(), ConnectionState::Closed(r) if r.is_terminal()));
    }

    #[test]
    fn open_resets_retry_counter() {
        let mut m = ConnectionMachine::new(fast_policy());
        m.connecting();
        m.closed(ABNORMAL_CLOSURE);
        m.connecting();
        m.closed(ABNORMAL_CLOSURE);
        assert_eq!(m.retries(), 2);
        m.connecting();
        m.opened();
        assert_eq!(m.retries(), 0);
        assert_eq!(
            m.closed(NO_STATUS_RECEIVED),
            NextStep::Reconnect {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn rejection_and_teardown() {
        let mut m = ConnectionMachine::new(fast_policy());
        m.rejected(CloseReason::Unauthorized { status: 403 });
        assert_eq!(
            m.state(),
            &ConnectionState::Closed(CloseReason::Unauthorized { status: 403 })
        );
        m.teardown();
        assert_eq!(m.state(), &ConnectionState::Idle);
    }

    #[test]
    fn socket_url_from_absolute_base() {
        assert_eq!(
            socket_url("http://localhost:8000", "ignored", "abc-123", "t1").unwrap(),
            "ws://localhost:8000/chat/ws/abc-123?token=t1"
        );
        assert_eq!(
            socket_url("https://portal.example.com/api/", "ignored", "abc", "t").unwrap(),
            "wss://portal.example.com/api/chat/ws/abc?token=t"
        );
    }

    #[test]
    fn socket_url_from_relative_base() {
        assert_eq!(
            socket_url("/api", "https://portal.example.com", "abc", "ws-cookie-auth").unwrap(),
            "wss://portal.example.com/api/chat/ws/abc?token=ws-cookie-auth"
        );
        assert_eq!(
            socket_url("/", "http://127.0.0.1:3000/", "abc", "t").unwrap(),
            "ws://127.0.0.1:3000/chat/ws/abc?token=t"
        );
        assert_eq!(
            socket_url("/api", "localhost:3000", "abc", "t"),
            Err(WsUrlError::Origin("localhost:3000".into()))
        );
        assert!(matches!(
            socket_url("ftp://x", "http://h", "abc", "t"),
            Err(WsUrlError::Scheme(_))
        ));
    }

    #[test]
    fn token_is_redacted() {
        assert_eq!(
            redact_token("ws://h/chat/ws/abc?token=secret"),
            "ws://h/chat/ws/abc?token=***"
        );
        assert_eq!(
            redact_token("ws://h/x?token=secret&v=1"),
            "ws://h/x?token=***&v=1"
        );
        assert_eq!(redact_token("ws://h/x"), "ws://h/x");
    }

    #[tokio::test]
    async fn missing_token_is_terminal() {
        let auth = AuthTokenProvider::new(
            crate::config::Environment::Development,
            std::env::temp_dir().join(format!("oncochat-ws-{}", uuid::Uuid::new_v4())),
            None,
        );
        let (mut manager, mut events) = WebSocketSessionManager::new(
            "/api",
            "http://127.0.0.1:1",
            Arc::new(auth),
            fast_policy(),
        );
        manager.set_session(Some("abc")).await;
        assert_eq!(
            manager.state(),
            ConnectionState::Closed(CloseReason::AuthenticationMissing)
        );
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Error(AUTH_TOKEN_MISSING.to_string()))
        );
        assert!(!manager.send("hi", ResponseKind::Text));
    }
}
