//! Chat WebSocket proxy. Upgrades at `/api/chat/ws/*` are rewritten to the upstream's native
//! `/chat/ws/*` before dialling; `/chat/ws/*` passes through unchanged.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{
        header::{AUTHORIZATION, COOKIE, HOST, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    protocol::{frame::coding::CloseCode, CloseFrame as WireCloseFrame},
    Message as WireMessage,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::server::GatewayState;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Map a gateway upgrade path to the upstream path; `None` when the path is not a chat socket.
pub fn rewrite_upgrade_path(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix("/api/chat/ws") {
        Some(format!("/chat/ws{}", rest))
    } else if path.starts_with("/chat/ws") {
        Some(path.to_string())
    } else {
        None
    }
}

/// `http(s)://` base to `ws(s)://`; other schemes are kept.
pub fn websocket_base(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    }
}

pub(crate) async fn ws_proxy(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(path) = rewrite_upgrade_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if path != uri.path() {
        log::info!("[ws-proxy] rewrite {} -> {}", uri.path(), path);
    }
    let mut target = format!("{}{}", websocket_base(state.config.gateway.upstream.ws_base()), path);
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let request = match upstream_request(&state, &target, &headers) {
        Ok(request) => request,
        Err(e) => {
            log::error!("[ws-proxy] bad upstream request for {}: {}", path, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let dial_timeout = Duration::from_secs(state.config.gateway.upstream.timeout_secs);
    let dialed = tokio::time::timeout(dial_timeout, tokio_tungstenite::connect_async(request)).await;
    let Ok(dialed) = dialed else {
        log::error!("[ws-proxy] upstream handshake for {} timed out after {:?}", path, dial_timeout);
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let upstream = match dialed {
        Ok((socket, _)) => socket,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            log::warn!("[ws-proxy] upstream refused {} with {}", path, status);
            return StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY)
                .into_response();
        }
        Err(e) => {
            log::error!("[ws-proxy] upstream connect failed for {}: {}", path, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    log::info!("[ws-proxy] connected {}", path);

    ws.on_upgrade(move |client| async move {
        pipe(client, upstream).await;
        log::info!("[ws-proxy] closed {}", path);
    })
}

fn upstream_request(
    state: &GatewayState,
    target: &str,
    headers: &HeaderMap,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    let mut request = target.into_client_request()?;
    let out = request.headers_mut();
    for name in [COOKIE, AUTHORIZATION, USER_AGENT] {
        if let Some(value) = headers.get(&name) {
            out.insert(name, value.clone());
        }
    }
    if !out.contains_key(AUTHORIZATION) {
        if let Some(credential) = state.credentials.resolve(headers) {
            if let Ok(value) = HeaderValue::from_str(&credential) {
                out.insert(AUTHORIZATION, value);
            }
        }
    }
    if let Some(host) = headers.get(HOST) {
        out.insert(FORWARDED_HOST, host.clone());
    }
    // The gateway itself listens on plain HTTP; a TLS terminator in front sets its own value.
    let proto = headers
        .get(FORWARDED_PROTO)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    out.insert(FORWARDED_PROTO, proto);
    Ok(request)
}

/// Copy frames both ways until either side closes.
async fn pipe(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(msg) = to_wire(msg) else { continue };
            let closing = matches!(msg, WireMessage::Close(_));
            if upstream_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(next) = upstream_rx.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("[ws-proxy] upstream read error: {}", e);
                    break;
                }
            };
            let Some(msg) = to_client(msg) else { continue };
            let closing = matches!(msg, AxumMessage::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {},
        _ = upstream_to_client => {},
    }
}

fn to_wire(msg: AxumMessage) -> Option<WireMessage> {
    match msg {
        AxumMessage::Text(text) => Some(WireMessage::Text(text)),
        AxumMessage::Binary(data) => Some(WireMessage::Binary(data)),
        AxumMessage::Close(frame) => Some(WireMessage::Close(frame.map(|f| WireCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        }))),
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => None,
    }
}

fn to_client(msg: WireMessage) -> Option<AxumMessage> {
    match msg {
        WireMessage::Text(text) => Some(AxumMessage::Text(text)),
        WireMessage::Binary(data) => Some(AxumMessage::Binary(data)),
        WireMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        }))),
        WireMessage::Ping(_) | WireMessage::Pong(_) | WireMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_api_prefix_only() {
        assert_eq!(
            rewrite_upgrade_path("/api/chat/ws/abc-123").as_deref(),
            Some("/chat/ws/abc-123")
        );
        assert_eq!(
            rewrite_upgrade_path("/chat/ws/abc-123").as_deref(),
            Some("/chat/ws/abc-123")
        );
        assert_eq!(rewrite_upgrade_path("/api/chat/session/today"), None);
        assert_eq!(rewrite_upgrade_path("/ws"), None);
    }

    #[test]
    fn websocket_base_swaps_scheme() {
        assert_eq!(websocket_base("http://localhost:8000/"), "ws://localhost:8000");
        assert_eq!(websocket_base("https://api.example.com"), "wss://api.example.com");
        assert_eq!(websocket_base("ws://chat:8001"), "ws://chat:8001");
    }

    #[test]
    fn forwarded_proto_follows_the_inbound_request() {
        let state = GatewayState::new(crate::config::Config::default()).unwrap();
        let target = "ws://localhost:8000/chat/ws/abc";

        let mut behind_tls = HeaderMap::new();
        behind_tls.insert(HOST, HeaderValue::from_static("chat.example.com"));
        behind_tls.insert(FORWARDED_PROTO, HeaderValue::from_static("https"));
        let request = upstream_request(&state, target, &behind_tls).unwrap();
        assert_eq!(request.headers()[&FORWARDED_PROTO], "https");
        assert_eq!(request.headers()[&FORWARDED_HOST], "chat.example.com");

        let request = upstream_request(&state, target, &HeaderMap::new()).unwrap();
        assert_eq!(request.headers()[&FORWARDED_PROTO], "http");
    }

    #[test]
    fn close_codes_survive_conversion() {
        let wire = to_wire(AxumMessage::Close(Some(AxumCloseFrame {
            code: 1000,
            reason: "bye".into(),
        })))
        .unwrap();
        match to_client(wire).unwrap() {
            AxumMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
