//! Where the caller's bearer credential comes from. Chosen once at startup.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;

use crate::config::Environment;

pub const AUTH_COOKIE: &str = "authToken";
pub const SESSION_COOKIE: &str = "sessionToken";

/// Resolves the `Authorization` value to forward upstream, if any.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;

    fn name(&self) -> &'static str;
}

/// Development: the browser keeps the token and sends `Authorization: Bearer ...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderCredentialSource;

impl CredentialSource for HeaderCredentialSource {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        authorization_header(headers)
    }

    fn name(&self) -> &'static str {
        "header"
    }
}

/// Production: HTTP-only cookies, falling back to an explicit `Authorization` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieCredentialSource;

impl CredentialSource for CookieCredentialSource {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, AUTH_COOKIE)
            .or_else(|| cookie_value(headers, SESSION_COOKIE))
            .map(|token| format!("Bearer {}", token))
            .or_else(|| authorization_header(headers))
    }

    fn name(&self) -> &'static str {
        "cookie"
    }
}

pub fn for_environment(environment: Environment) -> Arc<dyn CredentialSource> {
    match environment {
        Environment::Development => Arc::new(HeaderCredentialSource),
        Environment::Production => Arc::new(CookieCredentialSource),
    }
}

fn authorization_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First non-empty value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| k.trim() == name && !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn header_source_reads_authorization_only() {
        let src = HeaderCredentialSource;
        assert_eq!(
            src.resolve(&headers(&[("authorization", "Bearer abc")])),
            Some("Bearer abc".into())
        );
        assert_eq!(src.resolve(&headers(&[("cookie", "authToken=xyz")])), None);
    }

    #[test]
    fn cookie_source_prefers_auth_then_session_then_header() {
        let src = CookieCredentialSource;
        assert_eq!(
            src.resolve(&headers(&[
                ("cookie", "theme=dark; sessionToken=s1; authToken=a1"),
                ("authorization", "Bearer h1"),
            ])),
            Some("Bearer a1".into())
        );
        assert_eq!(
            src.resolve(&headers(&[("cookie", "sessionToken=s1")])),
            Some("Bearer s1".into())
        );
        assert_eq!(
            src.resolve(&headers(&[("cookie", "authToken="), ("authorization", "Bearer h1")])),
            Some("Bearer h1".into())
        );
        assert_eq!(src.resolve(&HeaderMap::new()), None);
    }

    #[test]
    fn selected_by_environment() {
        assert_eq!(for_environment(Environment::Development).name(), "header");
        assert_eq!(for_environment(Environment::Production).name(), "cookie");
    }
}
