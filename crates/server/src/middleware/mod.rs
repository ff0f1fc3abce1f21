//! Axum middleware for the RPC server.

pub mod correlation_id;

pub use correlation_id::{
    create_request_id_layers, request_span, CorrelationId, UuidRequestIdGenerator, X_REQUEST_ID,
};
