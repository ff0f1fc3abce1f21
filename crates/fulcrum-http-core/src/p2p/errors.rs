use thiserror::Error;

/// Errors raised by the P2P peer, its wire codec and the block decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum P2pError {
    #[error("P2P I/O error: {0}")]
    Io(String),

    #[error("P2P handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected network magic {got}, expected {expected}")]
    BadMagic { expected: String, got: String },

    #[error("Checksum mismatch in '{command}' message")]
    BadChecksum { command: String },

    #[error("P2P message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("P2P peer disconnected")]
    Disconnected,

    /// The peer is disabled in configuration.
    #[error("P2P peer is not connected")]
    NotConnected,

    #[error("Block {0} not found")]
    NotFound(String),

    #[error("Timed out waiting for block {0}")]
    Timeout(String),

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("P2P peer is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl P2pError {
    /// Returns `true` for errors that end the current session and trigger a reconnect.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) |
                Self::Handshake(_) |
                Self::BadMagic { .. } |
                Self::BadChecksum { .. } |
                Self::MessageTooLarge { .. } |
                Self::Disconnected
        )
    }
}
