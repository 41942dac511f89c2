//! OncoChat core library: chat session model, stream reconstruction, the interactive input
//! rules, the chat client (REST + socket), and the gateway that fronts the upstream API.

pub mod chat;
pub mod client;
pub mod config;
pub mod gateway;
pub mod init;
