//! HTTP client for the upstream API. Failures come back as values, never as errors that
//! escape a route handler.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

/// Status reported when the upstream could not be reached at all.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOk {
    pub status: u16,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub status: u16,
    pub message: String,
    pub details: Option<Value>,
}

pub type UpstreamResult = Result<UpstreamOk, UpstreamFailure>;

#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one upstream request. `credential` is a full `Authorization` value.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        credential: Option<&str>,
    ) -> UpstreamResult {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(credential) = credential {
            req = req.header(reqwest::header::AUTHORIZATION, credential);
        }

        let res = match req.send().await {
            Ok(res) => res,
            Err(e) => {
                log::error!("upstream {} {} unreachable: {}", method, path, e);
                return Err(UpstreamFailure {
                    status: TRANSPORT_FAILURE_STATUS,
                    message: e.to_string(),
                    details: None,
                });
            }
        };

        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        let data = parse_body(&text);
        if status.is_success() {
            log::debug!("upstream {} {} -> {}", method, path, status.as_u16());
            return Ok(UpstreamOk {
                status: status.as_u16(),
                data,
            });
        }

        log_failure(&method, path, status.as_u16());
        let message = data
            .get("detail")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            });
        Err(UpstreamFailure {
            status: status.as_u16(),
            message,
            details: (!data.is_null()).then_some(data),
        })
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn log_failure(method: &Method, path: &str, status: u16) {
    match status {
        401 => log::warn!("upstream {} {} -> 401 unauthorized (token missing or invalid)", method, path),
        403 => log::warn!("upstream {} {} -> 403 forbidden", method, path),
        404 => log::warn!("upstream {} {} -> 404 not found", method, path),
        s if s >= 500 => log::error!("upstream {} {} -> {} backend issue", method, path, s),
        s => log::warn!("upstream {} {} -> {}", method, path, s),
    }
}
