use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use super::errors::UpstreamError;

/// A live connection to one wallet-query server.
///
/// Implementations must fold "error returned as a value" responses into
/// [`UpstreamError::Rpc`] so callers only ever see one failure path.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issues a remote call with positional parameters.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, UpstreamError>;

    /// Closes the connection. Errors while closing are swallowed.
    async fn disconnect(&self);

    /// Returns `false` once the underlying transport has gone away.
    fn is_connected(&self) -> bool;
}

/// Opens [`UpstreamClient`] connections for the connection pool.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connects to the server named by `url`.
    ///
    /// # Errors
    ///
    /// Returns a connect-class [`UpstreamError`] (see [`UpstreamError::is_connect_error`]).
    async fn connect(&self, url: &Url) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}
