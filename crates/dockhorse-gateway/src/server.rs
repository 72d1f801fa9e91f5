//! Axum-based intercepting proxy server.
//!
//! Every request, whatever its path or method, goes through the same flow:
//!
//! ```text
//! client ──► Before phase ──► upstream daemon ──► After phase ──► client
//!                 │                                   │
//!                 └── short-circuit ──────────────────┴──► client
//! ```
//!
//! Exactly one response is written per request.

use crate::backend::{DockerBackend, Upstream, UpstreamRequest, is_hop_by_hop};
use crate::error::{GatewayError, GatewayResult};
use crate::filter::{FilterManager, NativeFilter, NativeFilterDefinition, PhaseOutcome};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use dockhorse_kernel::{Filter, Invoke, ProxyConfig, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Request / response values
// ─────────────────────────────────────────────────────────────────────────────

/// A buffered client request.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    /// Path and query as received.
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The single response written back to the client.
#[derive(Debug, Clone, Default)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProxyResponse {
    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(body),
        }
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        (status, headers, Body::from(self.body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared application state
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state injected into the proxy handler via [`State`] extractor.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<FilterManager>,
    upstream: Arc<dyn Upstream>,
}

impl AppState {
    pub fn new(manager: Arc<FilterManager>, upstream: Arc<dyn Upstream>) -> Self {
        Self { manager, upstream }
    }

    /// Run one request through Before → forward → After.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let request_id = Uuid::new_v4().to_string();
        let raw_path = request.uri.split('?').next().unwrap_or_default();
        let path = urlencoding::decode(raw_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| raw_path.to_string());

        let mut ctx = RequestContext::new(&request_id, &request.method, request.uri.as_str())
            .with_path(path)
            .with_body(request.body.to_vec());
        for (name, value) in &request.headers {
            ctx = ctx.with_header(name.as_str(), value.as_str());
        }

        // Before phase
        let forward_body = match self
            .manager
            .run_phase(Invoke::Before, &ctx, &request.body)
            .await
        {
            PhaseOutcome::ShortCircuit {
                filter,
                status,
                body,
            } => {
                info!(request_id = %request_id, filter = %filter, status, "request stopped by filter");
                return ProxyResponse::json(status, body);
            }
            PhaseOutcome::Continue { body, rewritten } if rewritten => Bytes::from(body),
            PhaseOutcome::Continue { .. } => request.body.clone(),
        };

        // Forward
        let upstream_request = UpstreamRequest {
            method: ctx.method.clone(),
            path_and_query: request.uri.clone(),
            headers: request
                .headers
                .iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .cloned()
                .collect(),
            body: forward_body,
        };
        let response = match self.upstream.forward(upstream_request).await {
            Ok(response) => response,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "upstream call failed");
                return ProxyResponse::json(e.status().as_u16(), proxy_error(&e));
            }
        };
        ctx.response_status = Some(response.status);

        // After phase
        match self
            .manager
            .run_phase(Invoke::After, &ctx, &response.body)
            .await
        {
            PhaseOutcome::ShortCircuit {
                filter,
                status,
                body,
            } => {
                info!(request_id = %request_id, filter = %filter, status, "response replaced by filter");
                ProxyResponse::json(status, body)
            }
            PhaseOutcome::Continue { body, rewritten } if rewritten => ProxyResponse {
                status: response.status,
                headers: response.headers,
                body: Bytes::from(body),
            },
            PhaseOutcome::Continue { .. } => ProxyResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            },
        }
    }
}

fn proxy_error(err: &GatewayError) -> String {
    dockhorse_kernel::proxy_error_body(&err.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// ProxyServer
// ─────────────────────────────────────────────────────────────────────────────

/// High-level server: configuration, filter set and upstream.
pub struct ProxyServer {
    config: ProxyConfig,
    filters: Vec<Arc<dyn Filter>>,
    upstream: Option<Arc<dyn Upstream>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            filters: Vec::new(),
            upstream: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = Arc<dyn Filter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Register a compiled-in filter.
    pub fn with_native_filter(self, definition: Arc<dyn NativeFilterDefinition>) -> Self {
        self.with_filter(NativeFilter::boxed(definition))
    }

    /// Replace the default [`DockerBackend`].
    pub fn with_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Build the axum [`Router`].  Call [`start()`](Self::start) to bind
    /// and serve.
    pub fn build_app(&self) -> GatewayResult<Router> {
        let upstream = match &self.upstream {
            Some(upstream) => Arc::clone(upstream),
            None => Arc::new(DockerBackend::new(
                &self.config.docker_sock_url,
                self.config.target_host_name.clone(),
                Duration::from_secs(self.config.upstream_timeout_secs),
            )?) as Arc<dyn Upstream>,
        };

        let manager = FilterManager::new(self.filters.clone());
        info!(
            before = manager.filters(Invoke::Before).len(),
            after = manager.filters(Invoke::After).len(),
            "filter pipeline ready"
        );

        let state = AppState::new(Arc::new(manager), upstream);
        Ok(Router::new()
            .fallback(proxy_handler)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(state))
    }

    /// Bind `listen_addr` and serve until ctrl-c / SIGTERM, then wait up to
    /// `shutdown_timeout_secs` for in-flight requests.
    pub async fn start(self) -> GatewayResult<()> {
        let app = self.build_app()?;
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            addr = %self.config.listen_addr,
            upstream = %self.config.docker_sock_url,
            "dockhorse proxy listening"
        );

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        tokio::select! {
            joined = &mut server => return flatten(joined),
            _ = shutdown_signal() => {}
        }

        info!("shutdown signal received, draining connections");
        let _ = stop_tx.send(());
        let grace = Duration::from_secs(self.config.shutdown_timeout_secs);
        match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(timeout_secs = grace.as_secs(), "graceful shutdown timed out");
                server.abort();
                Ok(())
            }
        }
    }
}

fn flatten(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> GatewayResult<()> {
    joined
        .map_err(|e| GatewayError::Internal(format!("server task failed: {e}")))?
        .map_err(GatewayError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Catch-all handler: every Docker API call lands here.
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let uri = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let request = ProxyRequest {
        method: method.to_string(),
        uri,
        headers,
        body,
    };
    let mut response = state.handle(request).await.into_response();
    response
        .headers_mut()
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));
    response
}
