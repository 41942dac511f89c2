//! Auth token provider for the chat client.
//!
//! Development keeps a bearer token on disk (or in `ONCOCHAT_AUTH_TOKEN`) and sends it in the
//! `Authorization` header and the socket query. Production relies on the gateway's HTTP-only
//! cookie; the socket query then carries a placeholder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;

use crate::config::{self, Config, Environment};

/// Socket `token` value used when authentication rides on cookies.
pub const COOKIE_AUTH_PLACEHOLDER: &str = "ws-cookie-auth";

#[derive(Debug)]
pub struct AuthTokenProvider {
    environment: Environment,
    token_path: PathBuf,
    env_token: Option<String>,
    jar: Arc<Jar>,
}

impl AuthTokenProvider {
    pub fn new(environment: Environment, token_path: PathBuf, env_token: Option<String>) -> Self {
        Self {
            environment,
            token_path,
            env_token,
            jar: Arc::new(Jar::default()),
        }
    }

    /// Mode from `client.environment`, token file from `client.tokenPath`.
    pub fn from_config(config: &Config, config_path: &Path) -> Self {
        Self::new(
            config.client.environment,
            config::resolve_token_path(config, config_path),
            config::resolve_env_auth_token(),
        )
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// The stored development token. Always `None` in production.
    pub fn token(&self) -> Option<String> {
        if self.environment.is_production() {
            return None;
        }
        if let Some(token) = &self.env_token {
            return Some(token.clone());
        }
        std::fs::read_to_string(&self.token_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn authorization_header(&self) -> Option<String> {
        self.token().map(|t| format!("Bearer {}", t))
    }

    /// Value for the socket URL's `token` query; `None` means the client is not logged in.
    pub fn websocket_token(&self) -> Option<String> {
        match self.environment {
            Environment::Production => Some(COOKIE_AUTH_PLACEHOLDER.to_string()),
            Environment::Development => self.token(),
        }
    }

    /// Cookie jar shared by the REST client; holds the gateway's auth cookie in production.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// `Cookie` header value for `url`, copied into the socket handshake.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Persist a development token. Production tokens live in cookies and are not stored.
    pub fn store_token(&self, token: &str) -> std::io::Result<()> {
        if self.environment.is_production() {
            log::debug!("production mode: token kept in cookie jar only");
            return Ok(());
        }
        if let Some(parent) = self.token_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.token_path, token.trim())?;
        log::info!("stored auth token at {}", self.token_path.display());
        Ok(())
    }

    /// Forget the stored development token (logout).
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.token_path) {
            Ok(()) => {
                log::info!("removed auth token at {}", self.token_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_token_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("oncochat-auth-{}", uuid::Uuid::new_v4()))
            .join("auth_token")
    }

    #[test]
    fn development_token_round_trips_through_file() {
        let path = temp_token_path();
        let auth = AuthTokenProvider::new(Environment::Development, path.clone(), None);
        assert_eq!(auth.websocket_token(), None);
        assert_eq!(auth.authorization_header(), None);

        auth.store_token("  abc123\n").unwrap();
        assert_eq!(auth.token().as_deref(), Some("abc123"));
        assert_eq!(auth.authorization_header().as_deref(), Some("Bearer abc123"));
        assert_eq!(auth.websocket_token().as_deref(), Some("abc123"));

        auth.clear().unwrap();
        auth.clear().unwrap();
        assert_eq!(auth.token(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn env_token_wins_over_file() {
        let auth = AuthTokenProvider::new(
            Environment::Development,
            temp_token_path(),
            Some("from-env".into()),
        );
        assert_eq!(auth.token().as_deref(), Some("from-env"));
    }

    #[test]
    fn production_uses_placeholder_and_no_header() {
        let auth = AuthTokenProvider::new(
            Environment::Production,
            temp_token_path(),
            Some("ignored".into()),
        );
        assert_eq!(auth.authorization_header(), None);
        assert_eq!(auth.websocket_token().as_deref(), Some(COOKIE_AUTH_PLACEHOLDER));
        auth.store_token("t").unwrap();
        assert!(!auth.token_path().exists());
    }

    #[test]
    fn cookie_header_reads_shared_jar() {
        let auth = AuthTokenProvider::new(Environment::Production, temp_token_path(), None);
        let url: Url = "http://127.0.0.1:3000/api/chat/ws/abc".parse().unwrap();
        auth.cookie_jar().add_cookie_str("authToken=xyz; Path=/", &url);
        assert_eq!(auth.cookie_header(&url).as_deref(), Some("authToken=xyz"));
    }
}
