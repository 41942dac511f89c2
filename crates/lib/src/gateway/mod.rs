//! Gateway: REST forwarding and chat WebSocket proxying on one port.
//!
//! Every `/api/*` route resolves the caller's credential, calls the upstream API, and answers
//! with a normalized envelope. Chat socket upgrades are rewritten and piped to the upstream.

pub mod credentials;
pub mod protocol;
mod routes;
mod server;
pub mod upstream;
pub mod ws_proxy;

pub use credentials::{CookieCredentialSource, CredentialSource, HeaderCredentialSource};
pub use protocol::{ApiEnvelope, ApiError, ErrorCode, ErrorMapping};
pub use server::{router, run_gateway, GatewayState};
pub use ws_proxy::rewrite_upgrade_path;
