//! Full-block download from a P2P network node.
//!
//! The wallet-query protocol only exposes headers and transactions one at a time, so
//! whole blocks come from a node speaking the Bitcoin-family P2P protocol:
//!
//! - [`codec`]: message framing with magic, command and checksum
//! - [`peer`]: the long-lived, self-reconnecting [`P2pPeer`]
//! - [`block`]: [`DecodedBlock`], splitting raw block bytes into header and transactions

pub mod block;
pub mod codec;
pub mod errors;
pub mod peer;

use async_trait::async_trait;
use bitcoin::BlockHash;

pub use block::{difficulty_from_bits, DecodedBlock};
pub use codec::{MessageCodec, RawMessage};
pub use errors::P2pError;
pub use peer::P2pPeer;

/// Source of serialized blocks, keyed by block hash.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Returns the serialized block.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError`] when the block cannot be obtained.
    async fn fetch_block(&self, hash: &BlockHash) -> Result<Vec<u8>, P2pError>;
}
