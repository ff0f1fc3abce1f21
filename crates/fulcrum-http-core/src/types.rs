//! Request and response envelopes for the HTTP side of the gateway.
//!
//! # Wire Shape
//!
//! Requests are loosely JSON-RPC shaped: `{"id"?, "method", "params"?}` with no
//! `jsonrpc` member required. Responses always carry `"jsonrpc": "2.0"` and echo the
//! request id on success. Failures use id `0` and error code [`GATEWAY_ERROR_CODE`].
//!
//! ```text
//! success: {"id": <id or 0>, "jsonrpc": "2.0", "result": <value>}
//! failure: {"id": 0, "jsonrpc": "2.0", "error": {"code": -1, "message": <string>}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

use crate::proxy::ProxyError;

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Error code used for every failure envelope the gateway emits.
pub const GATEWAY_ERROR_CODE: i32 = -1;

/// Message returned for requests without a usable `method`.
pub const MALFORMED_REQUEST_MESSAGE: &str = "Malformed request";

/// Method handled locally instead of being forwarded verbatim.
pub const BLOCK_GET_METHOD: &str = "blockchain.block.get";

/// Upstream method used to look up a block header by height or hash.
pub const HEADER_GET_METHOD: &str = "blockchain.header.get";

/// A single parsed HTTP call.
///
/// # Example
///
/// ```
/// use fulcrum_http_core::types::RpcRequest;
/// use serde_json::json;
///
/// let request = RpcRequest::from_value(json!({
///     "id": 7,
///     "method": "blockchain.block.get",
///     "params": [700000, 1]
/// }))
/// .unwrap();
///
/// assert_eq!(request.method, "blockchain.block.get");
/// assert_eq!(request.params.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: Option<Value>) -> Self {
        Self { id, method: method.into(), params }
    }

    /// Parses a request body that has already been decoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedRequest`] when the body is not an object, `method`
    /// is missing, empty or not a string, or `params` is present but not an array.
    pub fn from_value(body: Value) -> Result<Self, ProxyError> {
        let Value::Object(mut map) = body else {
            return Err(ProxyError::MalformedRequest);
        };

        let method = match map.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err(ProxyError::MalformedRequest),
        };

        let params = match map.remove("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(_) => return Err(ProxyError::MalformedRequest),
        };

        let id = map.remove("id").filter(|id| !id.is_null());

        Ok(Self { id, method, params })
    }

    /// Parses a raw HTTP body.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedRequest`] for invalid JSON or any shape rejected by
    /// [`RpcRequest::from_value`].
    pub fn from_slice(body: &[u8]) -> Result<Self, ProxyError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|_| ProxyError::MalformedRequest)?;
        Self::from_value(value)
    }

    /// Returns the id to echo in a success response, defaulting to `0`.
    #[must_use]
    pub fn response_id(&self) -> Value {
        self.id.clone().unwrap_or_else(|| Value::from(0))
    }
}

/// Error member of a failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Response envelope written back to the HTTP caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None }
    }

    /// Failure envelopes never echo the request id.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            id: Value::from(0),
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(RpcError { code: GATEWAY_ERROR_CODE, message: message.into() }),
        }
    }

    #[must_use]
    pub fn from_error(error: &ProxyError) -> Self {
        Self::failure(error.client_message())
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
