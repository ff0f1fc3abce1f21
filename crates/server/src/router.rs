use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::from_fn,
    routing::post,
    Json, Router,
};
use fulcrum_http_core::{config::ServerConfig, proxy::ProxyEngine, types::RpcResponse};
use std::sync::Arc;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer};

use crate::middleware::{create_request_id_layers, request_span};

/// Request header naming the upstream server URL for a call.
pub const SERVER_HEADER: &str = "server";

/// Handles one gateway call.
///
/// The body is passed to the dispatcher unparsed so every malformed shape, including
/// invalid JSON, gets the same failure envelope. Failures are returned with status 500.
pub async fn handle_rpc(
    State(proxy_engine): State<Arc<ProxyEngine>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<RpcResponse>) {
    let response = proxy_engine.handle_body(server_selector(&headers), &body).await;

    let status =
        if response.is_error() { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
    (status, Json(response))
}

/// Returns the trimmed `server` header, or `None` when absent, empty or not UTF-8.
fn server_selector(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|server| !server.is_empty())
}

/// Builds the application: `POST` on any path, wrapped in the server's layers.
///
/// Layers run outermost first: request id set and propagate, CORS, compression, body
/// limit, concurrency limit, then the per-request span. `Router::layer` wraps each route
/// separately, so the concurrency limit shares one semaphore across all of them.
pub fn create_app(proxy_engine: Arc<ProxyEngine>, config: &ServerConfig) -> Router {
    let (set_request_id, propagate_request_id) = create_request_id_layers();

    Router::new()
        .route("/", post(handle_rpc))
        .route("/{*path}", post(handle_rpc))
        .with_state(proxy_engine)
        .layer(from_fn(request_span))
        .layer(GlobalConcurrencyLimitLayer::new(config.max_concurrent_requests))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(propagate_request_id)
        .layer(set_request_id)
}
