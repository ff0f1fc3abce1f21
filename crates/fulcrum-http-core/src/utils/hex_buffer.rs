use sha2::{Digest, Sha256};

/// Error type for display-order hash parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Double SHA-256, the digest used for block and transaction identifiers.
///
/// The result is in wire (internal) byte order. Use [`display_hex`] to present it.
#[must_use]
pub fn sha256d(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    Sha256::digest(first).into()
}

/// Formats wire-order bytes as lowercase hex in display order (byte-reversed).
///
/// Block hashes, transaction ids and merkle roots are stored little-endian on the
/// wire but conventionally printed big-endian.
///
/// # Examples
/// ```
/// use fulcrum_http_core::utils::display_hex;
///
/// assert_eq!(display_hex(&[0x01, 0x02, 0xff]), "ff0201");
/// ```
#[must_use]
pub fn display_hex(bytes: &[u8]) -> String {
    let mut reversed = bytes.to_vec();
    reversed.reverse();
    hex::encode(reversed)
}

/// Parses a 64-character display-order hash into wire-order bytes.
///
/// # Errors
///
/// Returns [`HashParseError`] if the input is not valid hex or does not decode to
/// exactly 32 bytes.
pub fn parse_display_hash(s: &str) -> Result<[u8; 32], HashParseError> {
    let mut bytes = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes.reverse();
    bytes.try_into().map_err(|_| HashParseError::InvalidLength(len))
}
