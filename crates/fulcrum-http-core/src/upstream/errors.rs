use thiserror::Error;

/// Errors that can occur when talking to an Electrum upstream server.
///
/// Both failure styles of the wallet-query protocol end up here: transport-level
/// failures and error objects returned in place of a result ([`UpstreamError::Rpc`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The server selector could not be parsed as a URL.
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidServer { url: String, reason: String },

    /// The URL scheme is not one the client can speak.
    #[error("Unsupported server scheme: {0}")]
    UnsupportedScheme(String),

    /// Failed to establish a connection to the upstream server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connecting (including the version handshake) exceeded the configured deadline.
    #[error("Connection timeout")]
    ConnectTimeout,

    /// A call exceeded the configured deadline.
    #[error("Request timeout")]
    Timeout,

    /// Error object returned by the upstream server.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response from upstream could not be parsed or had an unexpected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The connection was closed while the call was pending, or before it was made.
    #[error("Connection closed")]
    Closed,
}

impl UpstreamError {
    /// Returns `true` if the error happened while establishing the connection.
    #[must_use]
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidServer { .. } |
                Self::UnsupportedScheme(_) |
                Self::ConnectionFailed(_) |
                Self::ConnectTimeout
        )
    }

    /// Message surfaced to HTTP callers.
    ///
    /// Upstream error objects are passed through verbatim; everything else uses the
    /// error's display form.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
