use crate::{p2p::P2pError, types::MALFORMED_REQUEST_MESSAGE, upstream::UpstreamError};

/// Single failure type returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    /// The body is not an object with a non-empty string `method`.
    #[error("{}", MALFORMED_REQUEST_MESSAGE)]
    MalformedRequest,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    P2p(#[from] P2pError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Message placed in the failure envelope.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream(e) => e.client_message(),
            other => other.to_string(),
        }
    }
}
