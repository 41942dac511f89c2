//! REST client for the gateway's chat and auth routes.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::auth::AuthTokenProvider;
use crate::chat::ChatSession;
use crate::config::ClientConfig;
use crate::gateway::{ApiEnvelope, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum ChatClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{message} ({code:?}, status {status})")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ChatClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated { tokens: AuthTokens },
    PasswordChangeRequired { session: String },
    ChallengeRequired { session: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    #[serde(default)]
    requires_password_change: bool,
    #[serde(default)]
    requires_challenge: bool,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    tokens: Option<AuthTokens>,
}

#[derive(Deserialize)]
struct PasswordData {
    tokens: AuthTokens,
}

/// Absolute `api_base` is used as is; a relative one is joined to `origin`.
pub fn resolve_api_base(api_base: &str, origin: &str) -> String {
    let api_base = api_base.trim();
    if api_base.starts_with("http://") || api_base.starts_with("https://") {
        return api_base.trim_end_matches('/').to_string();
    }
    let prefix = api_base.trim_matches('/');
    let origin = origin.trim().trim_end_matches('/');
    if prefix.is_empty() {
        origin.to_string()
    } else {
        format!("{}/{}", origin, prefix)
    }
}

#[derive(Clone)]
pub struct ChatRestClient {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<AuthTokenProvider>,
}

impl ChatRestClient {
    pub fn new(config: &ClientConfig, auth: Arc<AuthTokenProvider>) -> Result<Self, ChatClientError> {
        let client = reqwest::Client::builder()
            .cookie_provider(auth.cookie_jar())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: resolve_api_base(&config.api_base, &config.origin),
            client,
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &Arc<AuthTokenProvider> {
        &self.auth
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, ChatClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        if let Some(header) = self.auth.authorization_header() {
            req = req.header(reqwest::header::AUTHORIZATION, header);
        }
        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await?;
        log::debug!("{} {} -> {}", method, path, status.as_u16());

        let envelope: ApiEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ChatClientError::Api {
                    status: status.as_u16(),
                    code: ErrorCode::Unknown,
                    message: text,
                })
            }
            Err(e) => return Err(ChatClientError::Decode(format!("{} {}: {}", method, path, e))),
        };
        if !envelope.success {
            let (code, message) = envelope
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or((ErrorCode::Unknown, "request failed".to_string()));
            return Err(ChatClientError::Api {
                status: envelope.status,
                code,
                message,
            });
        }
        serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(|e| ChatClientError::Decode(format!("{} {}: {}", method, path, e)))
    }

    /// Today's session for `timezone`, created upstream if needed.
    pub async fn today_session(&self, timezone: &str) -> Result<ChatSession, ChatClientError> {
        self.request(Method::GET, "/chat/session/today", &[("timezone", timezone)], None)
            .await
    }

    pub async fn start_new_session(&self, timezone: &str) -> Result<ChatSession, ChatClientError> {
        self.request(
            Method::POST,
            "/chat/session/new",
            &[("timezone", timezone)],
            Some(json!({})),
        )
        .await
    }

    /// REST fallback for sending a message outside the socket.
    pub async fn send_message(&self, chat_uuid: &str, content: &str) -> Result<Value, ChatClientError> {
        self.request(
            Method::POST,
            "/chat/message",
            &[],
            Some(json!({ "chat_uuid": chat_uuid, "content": content })),
        )
        .await
    }

    pub async fn log_chemo_date(&self, date: NaiveDate, timezone: &str) -> Result<Value, ChatClientError> {
        self.request(
            Method::POST,
            "/chat/chemo/log",
            &[],
            Some(json!({
                "chemo_date": date.format("%Y-%m-%d").to_string(),
                "timezone": timezone,
            })),
        )
        .await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ChatClientError> {
        let data: LoginData = self
            .request(
                Method::POST,
                "/login",
                &[],
                Some(json!({ "email": email, "password": password })),
            )
            .await?;
        let session = data.session.unwrap_or_default();
        if data.requires_password_change {
            return Ok(LoginOutcome::PasswordChangeRequired { session });
        }
        if data.requires_challenge {
            return Ok(LoginOutcome::ChallengeRequired { session });
        }
        data.tokens
            .map(|tokens| LoginOutcome::Authenticated { tokens })
            .ok_or_else(|| ChatClientError::Decode("login response without tokens".to_string()))
    }

    pub async fn complete_new_password(
        &self,
        email: &str,
        new_password: &str,
        session: &str,
    ) -> Result<AuthTokens, ChatClientError> {
        let data: PasswordData = self
            .request(
                Method::POST,
                "/complete-new-password",
                &[],
                Some(json!({ "email": email, "new_password": new_password, "session": session })),
            )
            .await?;
        Ok(data.tokens)
    }

    /// Clear the gateway cookie and the stored development token.
    pub async fn logout(&self) -> Result<(), ChatClientError> {
        let result: Result<Value, _> = self.request(Method::POST, "/logout", &[], None).await;
        if let Err(e) = self.auth.clear() {
            log::warn!("could not remove stored token: {}", e);
        }
        result.map(|_| ())
    }
}
