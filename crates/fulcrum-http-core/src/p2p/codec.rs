//! Bitcoin-family P2P message framing.
//!
//! ```text
//! ┌────────┬──────────────┬─────────────┬──────────┬─────────────┐
//! │ magic  │ command      │ payload len │ checksum │ payload     │
//! │ 4      │ 12, NUL pad  │ 4, LE       │ 4        │ payload len │
//! └────────┴──────────────┴─────────────┴──────────┴─────────────┘
//! ```
//!
//! The checksum is the first four bytes of the double SHA-256 of the payload. Payload
//! sizes are bounded by the codec's own limit rather than the 4 MB cap generic decoders
//! enforce, since Bitcoin Cash blocks can be far larger.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::errors::P2pError;
use crate::utils::sha256d;

pub const HEADER_LEN: usize = 24;
pub const COMMAND_LEN: usize = 12;

/// One framed message as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: [u8; 4],
    max_payload: usize,
}

impl MessageCodec {
    #[must_use]
    pub fn new(magic: [u8; 4], max_payload: usize) -> Self {
        Self { magic, max_payload }
    }

    #[must_use]
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Frames `payload` under `command`. Commands longer than 12 bytes are truncated.
    #[must_use]
    pub fn encode(&self, command: &str, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&self.magic);

        let mut name = [0u8; COMMAND_LEN];
        for (slot, byte) in name.iter_mut().zip(command.as_bytes()) {
            *slot = *byte;
        }
        frame.extend_from_slice(&name);

        // Payloads are bounded well below u32::MAX by the callers.
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(payload));
        frame.extend_from_slice(payload);
        frame
    }

    /// Reads one message, validating magic, size and checksum.
    ///
    /// # Errors
    ///
    /// [`P2pError::Disconnected`] when the stream ends at or inside a frame,
    /// [`P2pError::BadMagic`], [`P2pError::MessageTooLarge`] and [`P2pError::BadChecksum`]
    /// for framing violations, [`P2pError::Io`] for other read failures.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<RawMessage, P2pError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        read_exact(reader, &mut header).await?;

        if header[..4] != self.magic {
            return Err(P2pError::BadMagic {
                expected: hex::encode(self.magic),
                got: hex::encode(&header[..4]),
            });
        }

        let command = parse_command(&header[4..16]);

        let mut len = [0u8; 4];
        len.copy_from_slice(&header[16..20]);
        let size = u32::from_le_bytes(len) as usize;
        if size > self.max_payload {
            return Err(P2pError::MessageTooLarge { size, limit: self.max_payload });
        }

        let mut payload = vec![0u8; size];
        read_exact(reader, &mut payload).await?;

        if checksum(&payload) != header[20..24] {
            return Err(P2pError::BadChecksum { command });
        }

        Ok(RawMessage { command, payload })
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

fn parse_command(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), P2pError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(P2pError::Disconnected),
        Err(e) => Err(e.into()),
    }
}
