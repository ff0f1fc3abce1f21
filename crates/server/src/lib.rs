//! HTTP front end of the gateway.
//!
//! - [`router`]: the single RPC handler and the layered axum application
//! - [`middleware`]: request correlation ids and per-request tracing spans

pub mod middleware;
pub mod router;
