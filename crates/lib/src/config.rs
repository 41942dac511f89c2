//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.oncochat/config.json`) and environment.
//! One file serves both the gateway process and the terminal chat client.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Chat client settings (`oncochat login`, `oncochat chat`).
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Deployment mode. Decides how credentials travel (header vs. HTTP-only cookie).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Gateway bind, port, CORS, and upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 3000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub environment: Environment,

    /// Browser origins allowed to call the gateway with credentials.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Lifetime of the `authToken` cookie set in production.
    #[serde(default = "default_cookie_max_age_secs")]
    pub cookie_max_age_secs: u64,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// The API and chat service the gateway forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_api_base")]
    pub api_base: String,

    /// Base for chat sockets; `apiBase` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_base: Option<String>,

    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn ws_base(&self) -> &str {
        self.ws_base
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.api_base)
    }
}

/// Terminal chat client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// REST base: absolute URL, or a path joined to `origin` (same-origin deployment).
    #[serde(default = "default_client_api_base")]
    pub api_base: String,

    #[serde(default = "default_client_origin")]
    pub origin: String,

    /// IANA timezone sent with session and chemo-log requests.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub environment: Environment,

    /// Where the development bearer token is kept. Default: `auth_token` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_session_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

fn default_cookie_max_age_secs() -> u64 {
    3600
}

fn default_upstream_api_base() -> String {
    "http://localhost:8000".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_client_api_base() -> String {
    "/api".to_string()
}

fn default_client_origin() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_session_timeout_minutes() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            environment: Environment::default(),
            cors_origins: default_cors_origins(),
            cookie_max_age_secs: default_cookie_max_age_secs(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_upstream_api_base(),
            ws_base: None,
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: default_client_api_base(),
            origin: default_client_origin(),
            timezone: default_timezone(),
            environment: Environment::default(),
            token_path: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_session_timeout_minutes(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Apply environment overrides using `lookup` (normally `std::env::var`).
/// Values are trimmed; empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = non_empty(lookup("ONCOCHAT_ENV")) {
        match Environment::parse(&raw) {
            Some(env) => {
                config.gateway.environment = env;
                config.client.environment = env;
            }
            None => log::warn!("ignoring unknown ONCOCHAT_ENV value: {}", raw),
        }
    }
    if let Some(base) = non_empty(lookup("BACKEND_URL")) {
        config.gateway.upstream.api_base = base;
    }
    if let Some(base) = non_empty(lookup("API_BASE")) {
        config.client.api_base = base;
    }
    if let Some(raw) = non_empty(lookup("PORT")) {
        match raw.parse::<u16>() {
            Ok(port) => config.gateway.port = port,
            Err(_) => log::warn!("ignoring invalid PORT value: {}", raw),
        }
    }
}

/// Resolve a development bearer token from env ONCOCHAT_AUTH_TOKEN.
pub fn resolve_env_auth_token() -> Option<String> {
    non_empty(std::env::var("ONCOCHAT_AUTH_TOKEN").ok())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("ONCOCHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".oncochat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or ONCOCHAT_CONFIG_PATH). Missing file => default config.
/// Environment overrides are applied on top. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok((config, path))
}

/// Resolve the development token file: `client.tokenPath` if set (relative paths resolved
/// against the config file's parent), otherwise `auth_token` next to the config file.
pub fn resolve_token_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.client.token_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("auth_token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.environment, Environment::Development);
        assert_eq!(config.gateway.upstream.ws_base(), "http://localhost:8000");
        assert_eq!(config.client.api_base, "/api");
        assert_eq!(config.session.timeout_minutes, 60);
    }

    #[test]
    fn parses_camel_case_file() {
        let config: Config = serde_json::from_str(
            r#"{
                "gateway": {"port": 8080, "environment": "production",
                            "upstream": {"apiBase": "http://api:8000", "wsBase": "http://chat:8001"}},
                "client": {"apiBase": "https://portal.example.com/api", "timezone": "America/New_York"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert!(config.gateway.environment.is_production());
        assert_eq!(config.gateway.upstream.ws_base(), "http://chat:8001");
        assert_eq!(config.gateway.upstream.timeout_secs, 10);
        assert_eq!(config.client.timezone, "America/New_York");
        assert_eq!(config.client.origin, "http://127.0.0.1:3000");
    }

    #[test]
    fn env_overrides_trim_and_skip_empty() {
        let env: HashMap<&str, &str> = [
            ("ONCOCHAT_ENV", " production "),
            ("BACKEND_URL", "http://backend:9000"),
            ("API_BASE", "   "),
            ("PORT", "4000"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.gateway.environment, Environment::Production);
        assert_eq!(config.client.environment, Environment::Production);
        assert_eq!(config.gateway.upstream.api_base, "http://backend:9000");
        assert_eq!(config.client.api_base, "/api");
        assert_eq!(config.gateway.port, 4000);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| match k {
            "ONCOCHAT_ENV" => Some("staging".into()),
            "PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.gateway.environment, Environment::Development);
        assert_eq!(config.gateway.port, 3000);
    }

    #[test]
    fn token_path_default_and_relative() {
        let path = Path::new("/home/user/.oncochat/config.json");
        let mut config = Config::default();
        assert_eq!(
            resolve_token_path(&config, path),
            PathBuf::from("/home/user/.oncochat/auth_token")
        );
        config.client.token_path = Some(PathBuf::from("secrets/token"));
        assert_eq!(
            resolve_token_path(&config, path),
            PathBuf::from("/home/user/.oncochat/secrets/token")
        );
    }
}
