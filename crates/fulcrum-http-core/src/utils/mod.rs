//! Shared helpers for hashing and hex presentation of chain data.

pub mod hex_buffer;

pub use hex_buffer::{display_hex, parse_display_hash, sha256d, HashParseError};
