//! Chat client: auth tokens, REST calls, and the chat socket session.

pub mod auth;
pub mod rest;
pub mod ws;

pub use auth::{AuthTokenProvider, COOKIE_AUTH_PLACEHOLDER};
pub use rest::{AuthTokens, ChatClientError, ChatRestClient, LoginOutcome};
pub use ws::{
    socket_url, CloseReason, ConnectionMachine, ConnectionState, RetryPolicy, SessionEvent,
    WebSocketSessionManager,
};
