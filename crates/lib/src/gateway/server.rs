//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::gateway::credentials::{self, CredentialSource};
use crate::gateway::routes;
use crate::gateway::upstream::UpstreamClient;
use crate::gateway::ws_proxy;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Shared, immutable per-process state. Requests never mutate it.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub upstream: UpstreamClient,
    /// Picked once from `gateway.environment`.
    pub credentials: Arc<dyn CredentialSource>,
}

impl GatewayState {
    pub fn new(config: Config) -> Result<Self> {
        let upstream = UpstreamClient::new(
            &config.gateway.upstream.api_base,
            Duration::from_secs(config.gateway.upstream.timeout_secs),
        )
        .context("building upstream HTTP client")?;
        let credentials = credentials::for_environment(config.gateway.environment);
        log::info!(
            "gateway environment {:?}, credentials from {}",
            config.gateway.environment,
            credentials.name()
        );
        Ok(Self {
            config: Arc::new(config),
            upstream,
            credentials,
        })
    }
}

/// Full gateway router: REST routes, chat socket proxy, CORS, body limit, request log.
pub fn router(state: GatewayState) -> Router {
    let cors = cors_layer(&state.config.gateway.cors_origins);
    routes::api_router()
        .route("/api/chat/ws/*rest", get(ws_proxy::ws_proxy))
        .route("/chat/ws/*rest", get(ws_proxy::ws_proxy))
        .fallback(routes::route_not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(cors)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    log::info!(
        "{} {} {} {}ms",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Run the gateway (HTTP + WebSocket proxy on one port).
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && !config.gateway.environment.is_production() {
        log::warn!(
            "gateway bound to {} in development mode; Authorization headers are trusted as sent",
            bind
        );
    }
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let upstream_base = config.gateway.upstream.api_base.clone();
    let state = GatewayState::new(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {} (upstream {})", bind_addr, upstream_base);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}
