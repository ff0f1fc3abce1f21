use bitcoin::{hashes::Hash, BlockHash};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::{
    p2p::{block::HEADER_SIZE, DecodedBlock, P2pError},
    proxy::engine::SharedContext,
    types::HEADER_GET_METHOD,
    upstream::{UpstreamClient, UpstreamError},
    utils::{parse_display_hash, sha256d},
};

use super::super::errors::ProxyError;

/// Shape of a `blockchain.block.get` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Raw block hex.
    Raw,
    /// Block record with transaction hashes.
    Hashes,
    /// Block record with raw transaction hex.
    Transactions,
}

impl Verbosity {
    /// Interprets the optional verbosity parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidParams`] for anything other than a boolean, an
    /// integral number or null.
    pub fn from_param(param: Option<&Value>) -> Result<Self, ProxyError> {
        match param {
            None | Some(Value::Null | Value::Bool(false)) => Ok(Self::Raw),
            Some(Value::Bool(true)) => Ok(Self::Hashes),
            // Integral floats such as `1.0` count as the matching integer.
            Some(Value::Number(n)) => match n.as_f64() {
                Some(level) if level.fract() == 0.0 => Ok(if level == 0.0 {
                    Self::Raw
                } else if level == 1.0 {
                    Self::Hashes
                } else {
                    Self::Transactions
                }),
                _ => Err(ProxyError::InvalidParams(format!(
                    "verbosity must be an integer, got {n}"
                ))),
            },
            Some(other) => Err(ProxyError::InvalidParams(format!(
                "verbosity must be a boolean or integer, got {other}"
            ))),
        }
    }
}

/// Block description in the shape full nodes use for `getblock`.
///
/// `mediantime` and `nextblockhash` need chain context the gateway does not have and
/// are left out; `confirmations` is always `-1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockRecord {
    pub hash: String,
    pub confirmations: i64,
    pub size: usize,
    pub height: u64,
    pub version: i32,
    #[serde(rename = "versionHex")]
    pub version_hex: String,
    pub merkleroot: String,
    pub tx: Vec<String>,
    pub time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mediantime: Option<u32>,
    pub nonce: u32,
    pub bits: String,
    pub difficulty: f64,
    #[serde(rename = "nTx")]
    pub n_tx: usize,
    pub previousblockhash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<String>,
}

impl BlockRecord {
    /// Builds the record for `block`. [`Verbosity::Raw`] is treated as [`Verbosity::Hashes`].
    #[must_use]
    pub fn new(block: &DecodedBlock, height: u64, verbosity: Verbosity) -> Self {
        let header = block.header();
        let version = header.version.to_consensus();

        let tx = match verbosity {
            Verbosity::Transactions => block.raw_transactions().map(hex::encode).collect(),
            Verbosity::Raw | Verbosity::Hashes => block.transaction_hashes(),
        };

        Self {
            hash: block.hash().to_string(),
            confirmations: -1,
            size: block.size(),
            height,
            version,
            version_hex: format!("{version:08x}"),
            merkleroot: header.merkle_root.to_string(),
            tx,
            time: header.time,
            mediantime: None,
            nonce: header.nonce,
            bits: format!("{:08x}", header.bits.to_consensus()),
            difficulty: block.difficulty(),
            n_tx: block.tx_count(),
            previousblockhash: header.prev_blockhash.to_string(),
            nextblockhash: None,
        }
    }
}

/// Result of a `blockchain.header.get` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderLookup {
    height: Option<u64>,
    raw: Vec<u8>,
}

/// Handler for `blockchain.block.get`.
///
/// Resolves the block hash (through a header lookup when given a height), downloads the
/// block from the P2P peer and reshapes it according to the requested verbosity.
pub struct BlocksHandler {
    ctx: Arc<SharedContext>,
}

impl BlocksHandler {
    #[must_use]
    pub fn new(ctx: Arc<SharedContext>) -> Self {
        Self { ctx }
    }

    /// Dispatches on the shape of the first parameter: a number selects a lookup by
    /// height, a string a lookup by hash. Remaining params are `[verbosity, knownHeight]`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidParams`] for a missing or malformed height, hash,
    /// verbosity or known height, plus any error of the resolve step.
    pub async fn handle_block_get(
        &self,
        client: &dyn UpstreamClient,
        params: &[Value],
    ) -> Result<Value, ProxyError> {
        let verbosity = Verbosity::from_param(params.get(1))?;

        match params.first() {
            Some(Value::Number(height)) => {
                let height = height.as_u64().ok_or_else(|| {
                    ProxyError::InvalidParams(format!(
                        "block height must be a non-negative integer, got {height}"
                    ))
                })?;
                self.resolve_by_height(client, height, verbosity).await
            }
            Some(Value::String(hash)) => {
                let hash = parse_block_hash(hash)?;
                let known_height = parse_known_height(params.get(2))?;
                self.resolve_by_hash(client, hash, verbosity, known_height).await
            }
            Some(other) => Err(ProxyError::InvalidParams(format!(
                "expected a block height or hash, got {other}"
            ))),
            None => Err(ProxyError::InvalidParams("missing block height or hash".into())),
        }
    }

    /// Looks up the header at `height` and resolves the block by its hash.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] when the header lookup fails or returns
    /// something other than an 80-byte header, plus any error of
    /// [`BlocksHandler::resolve_by_hash`].
    pub async fn resolve_by_height(
        &self,
        client: &dyn UpstreamClient,
        height: u64,
        verbosity: Verbosity,
    ) -> Result<Value, ProxyError> {
        let header = lookup_header(client, json!(height)).await?;
        let hash = BlockHash::from_byte_array(sha256d(&header.raw));
        let height = header.height.unwrap_or(height);

        debug!(height, hash = %hash, "resolved block hash from header");
        self.resolve_by_hash(client, hash, verbosity, Some(height)).await
    }

    /// Downloads the block and shapes it for `verbosity`.
    ///
    /// The height reported in the record is `known_height` when given, else the BIP34
    /// height from the coinbase, else the height from a header lookup by hash.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::P2p`] when the block cannot be fetched or decoded and
    /// [`ProxyError::Upstream`] when the fallback height lookup fails.
    pub async fn resolve_by_hash(
        &self,
        client: &dyn UpstreamClient,
        hash: BlockHash,
        verbosity: Verbosity,
        known_height: Option<u64>,
    ) -> Result<Value, ProxyError> {
        let raw = self.ctx.block_source.fetch_block(&hash).await?;
        debug!(hash = %hash, size = raw.len(), "block downloaded");

        if verbosity == Verbosity::Raw {
            return Ok(Value::String(hex::encode(raw)));
        }

        let block = DecodedBlock::decode(raw)?;
        if block.hash() != hash {
            return Err(P2pError::MalformedBlock(format!(
                "expected block {hash}, received {}",
                block.hash()
            ))
            .into());
        }

        let height = match known_height.or_else(|| block.coinbase_height()) {
            Some(height) => height,
            None => lookup_header(client, json!(hash.to_string())).await?.height.ok_or_else(
                || {
                    UpstreamError::InvalidResponse(format!(
                        "header lookup for {hash} did not report a height"
                    ))
                },
            )?,
        };

        serde_json::to_value(BlockRecord::new(&block, height, verbosity))
            .map_err(|e| ProxyError::Internal(format!("failed to serialize block record: {e}")))
    }
}

async fn lookup_header(
    client: &dyn UpstreamClient,
    key: Value,
) -> Result<HeaderLookup, ProxyError> {
    let result = client.request(HEADER_GET_METHOD, vec![key]).await?;

    let (height, hex) = match &result {
        Value::Object(map) => {
            (map.get("height").and_then(Value::as_u64), map.get("hex").and_then(Value::as_str))
        }
        Value::String(hex) => (None, Some(hex.as_str())),
        _ => (None, None),
    };

    let hex = hex.ok_or_else(|| invalid_header(format!("unexpected header result {result}")))?;
    let raw = hex::decode(hex).map_err(|e| invalid_header(format!("header is not hex: {e}")))?;
    if raw.len() != HEADER_SIZE {
        return Err(invalid_header(format!(
            "header is {} bytes, expected {HEADER_SIZE}",
            raw.len()
        )));
    }

    Ok(HeaderLookup { height, raw })
}

fn invalid_header(message: String) -> ProxyError {
    UpstreamError::InvalidResponse(message).into()
}

fn parse_block_hash(hash: &str) -> Result<BlockHash, ProxyError> {
    parse_display_hash(hash)
        .map(BlockHash::from_byte_array)
        .map_err(|e| ProxyError::InvalidParams(format!("invalid block hash '{hash}': {e}")))
}

fn parse_known_height(param: Option<&Value>) -> Result<Option<u64>, ProxyError> {
    match param {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            ProxyError::InvalidParams(format!(
                "known height must be a non-negative integer, got {value}"
            ))
        }),
    }
}
