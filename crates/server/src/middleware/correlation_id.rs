//! Request correlation ids.
//!
//! Every request gets an `x-request-id` (the caller's, or a fresh UUID v4), echoed on
//! the response and attached to the tracing span the request is handled in, so log
//! lines from the pool and the P2P peer can be tied back to one HTTP call.

use axum::{
    extract::Request,
    http::{header::HeaderValue, HeaderMap, HeaderName},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation id of the request being handled, stored in request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub Arc<str>);

impl CorrelationId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Reads the id from `x-request-id`, ignoring values that are not visible ASCII.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(&X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Default)]
pub struct UuidRequestIdGenerator;

impl MakeRequestId for UuidRequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(HeaderValue::from_str(&id).ok()?))
    }
}

/// Returns the set and propagate layers for `x-request-id`.
///
/// The set layer must wrap the propagate layer, so apply propagate first:
///
/// ```ignore
/// let (set_layer, propagate_layer) = create_request_id_layers();
/// let app = Router::new()
///     .route("/", post(handler))
///     .layer(propagate_layer)
///     .layer(set_layer);
/// ```
#[must_use]
pub fn create_request_id_layers(
) -> (SetRequestIdLayer<UuidRequestIdGenerator>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::new(X_REQUEST_ID.clone(), UuidRequestIdGenerator),
        PropagateRequestIdLayer::new(X_REQUEST_ID.clone()),
    )
}

/// Runs the rest of the stack inside an `http_request` span carrying the request id.
///
/// Expects the set layer to have run already; a request that still has no id gets a
/// generated one for the span only.
pub async fn request_span(mut request: Request, next: Next) -> Response {
    let correlation_id =
        CorrelationId::from_headers(request.headers()).unwrap_or_else(CorrelationId::generate);

    let span = info_span!(
        "http_request",
        request_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    request.extensions_mut().insert(correlation_id);

    next.run(request).instrument(span).await
}
