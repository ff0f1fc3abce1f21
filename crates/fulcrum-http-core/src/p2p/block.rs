//! Decoding of raw block bytes fetched from the P2P peer.

use bitcoin::{
    block::Header,
    consensus::encode::{deserialize_partial, VarInt},
    hashes::Hash,
    BlockHash, Transaction,
};
use std::ops::Range;

use super::errors::P2pError;
use crate::utils::{display_hex, sha256d};

pub const HEADER_SIZE: usize = 80;

/// Smallest possible serialized transaction, used to bound the declared tx count.
const MIN_TX_SIZE: usize = 60;

/// A block split into its header and raw transaction byte spans.
///
/// Transactions are fully parsed once to find their boundaries; afterwards only the
/// byte ranges are kept, so raw and hashed views are cheap slices of the original bytes.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    raw: Vec<u8>,
    header: Header,
    tx_spans: Vec<Range<usize>>,
    coinbase_height: Option<u64>,
}

impl DecodedBlock {
    /// Parses a serialized block.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::MalformedBlock`] when the header or any transaction fails to
    /// parse, or when bytes remain after the last transaction.
    pub fn decode(raw: Vec<u8>) -> Result<Self, P2pError> {
        let (header, mut offset) = deserialize_partial::<Header>(&raw)
            .map_err(|e| P2pError::MalformedBlock(format!("header: {e}")))?;

        let (VarInt(count), used) = deserialize_partial::<VarInt>(&raw[offset..])
            .map_err(|e| P2pError::MalformedBlock(format!("transaction count: {e}")))?;
        offset += used;

        let remaining = raw.len() - offset;
        let count = usize::try_from(count)
            .ok()
            .filter(|count| count.saturating_mul(MIN_TX_SIZE) <= remaining)
            .ok_or_else(|| {
                P2pError::MalformedBlock(format!(
                    "{count} transactions cannot fit in {remaining} bytes"
                ))
            })?;

        let mut tx_spans = Vec::with_capacity(count);
        let mut coinbase_height = None;

        for index in 0..count {
            let (tx, used) = deserialize_partial::<Transaction>(&raw[offset..])
                .map_err(|e| P2pError::MalformedBlock(format!("transaction {index}: {e}")))?;

            if index == 0 && header.version.to_consensus() >= 2 {
                coinbase_height =
                    tx.input.first().and_then(|input| bip34_height(input.script_sig.as_bytes()));
            }

            tx_spans.push(offset..offset + used);
            offset += used;
        }

        if offset != raw.len() {
            return Err(P2pError::MalformedBlock(format!(
                "{} trailing bytes after last transaction",
                raw.len() - offset
            )));
        }

        Ok(Self { raw, header, tx_spans, coinbase_height })
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Double SHA-256 of the 80 header bytes.
    #[must_use]
    pub fn hash(&self) -> BlockHash {
        BlockHash::from_byte_array(sha256d(&self.raw[..HEADER_SIZE]))
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn tx_count(&self) -> usize {
        self.tx_spans.len()
    }

    pub fn raw_transactions(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        self.tx_spans.iter().map(|span| &self.raw[span.clone()])
    }

    /// Transaction hashes in block order, display (reversed) hex.
    #[must_use]
    pub fn transaction_hashes(&self) -> Vec<String> {
        self.raw_transactions().map(|tx| display_hex(&sha256d(tx))).collect()
    }

    /// Height committed in the coinbase script (BIP34), for version 2+ blocks.
    #[must_use]
    pub fn coinbase_height(&self) -> Option<u64> {
        self.coinbase_height
    }

    #[must_use]
    pub fn difficulty(&self) -> f64 {
        difficulty_from_bits(self.header.bits.to_consensus())
    }
}

/// Converts a compact target into a difficulty relative to the minimum target.
#[must_use]
pub fn difficulty_from_bits(bits: u32) -> f64 {
    let mut shift = (bits >> 24) & 0xff;
    let mantissa = f64::from(bits & 0x00ff_ffff);
    if mantissa == 0.0 {
        return 0.0;
    }

    let mut difficulty = f64::from(0x0000_ffff_u32) / mantissa;
    while shift < 29 {
        difficulty *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        difficulty /= 256.0;
        shift -= 1;
    }
    difficulty
}

/// Reads the height pushed as the first coinbase script element.
fn bip34_height(script: &[u8]) -> Option<u64> {
    let (&opcode, rest) = script.split_first()?;
    match opcode {
        0x00 => Some(0),
        // OP_1 ..= OP_16
        0x51..=0x60 => Some(u64::from(opcode - 0x50)),
        len @ 0x01..=0x08 => {
            let bytes = rest.get(..usize::from(len))?;
            Some(bytes.iter().rev().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
        }
        _ => None,
    }
}
