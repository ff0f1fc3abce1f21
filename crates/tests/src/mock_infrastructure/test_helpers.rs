//! Block fixtures and configuration shortcuts shared by the integration tests.

use bitcoin::{
    absolute::LockTime,
    block::{Header, Version},
    consensus::{deserialize, serialize},
    hashes::Hash,
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use fulcrum_http_core::config::{P2pConfig, UpstreamConfig};
use std::net::SocketAddr;

/// Serialized Bitcoin genesis block.
pub const GENESIS_HEX: &str = concat!(
    "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b2",
    "7ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100",
    "00000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104",
    "455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b20",
    "6f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104",
    "678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504",
    "e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000",
);

pub const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

pub const GENESIS_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// Network magic used by every mock in this crate.
pub const TEST_MAGIC: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];

/// A block fixture together with the height it is served at.
#[derive(Debug, Clone)]
pub struct TestBlock {
    pub height: u64,
    pub block: Block,
}

impl TestBlock {
    /// The genesis block at height 0.
    ///
    /// # Panics
    ///
    /// Panics if [`GENESIS_HEX`] does not decode, which would be a fixture bug.
    #[must_use]
    pub fn genesis() -> Self {
        let raw = hex::decode(GENESIS_HEX).expect("genesis fixture is valid hex");
        let block = deserialize(&raw).expect("genesis fixture is a valid block");
        Self { height: 0, block }
    }

    /// A version-2+ block at `height` with a BIP34 coinbase and `extra_txs` spends.
    #[must_use]
    pub fn synthetic(height: u64, extra_txs: usize) -> Self {
        let mut txdata = vec![transaction(OutPoint::null(), bip34_script(height), 625_000_000)];
        for i in 0..extra_txs {
            let seed = u8::try_from(i % 250).unwrap_or(0) + 1;
            let previous = OutPoint { txid: Txid::from_byte_array([seed; 32]), vout: 1 };
            txdata.push(transaction(previous, vec![0x00, seed], 10_000 + i as u64));
        }

        let block = Block {
            header: Header {
                version: Version::from_consensus(0x2000_0000),
                prev_blockhash: BlockHash::from_byte_array([0x11; 32]),
                merkle_root: TxMerkleNode::from_byte_array([0x22; 32]),
                time: 1_700_000_000 + u32::try_from(height % 1_000_000).unwrap_or(0),
                bits: CompactTarget::from_consensus(0x1803_0f3c),
                nonce: 7,
            },
            txdata,
        };

        Self { height, block }
    }

    #[must_use]
    pub fn hash(&self) -> BlockHash {
        self.block.block_hash()
    }

    #[must_use]
    pub fn hash_hex(&self) -> String {
        self.hash().to_string()
    }

    #[must_use]
    pub fn raw(&self) -> Vec<u8> {
        serialize(&self.block)
    }

    #[must_use]
    pub fn raw_hex(&self) -> String {
        hex::encode(self.raw())
    }

    #[must_use]
    pub fn header_hex(&self) -> String {
        hex::encode(serialize(&self.block.header))
    }

    /// Transaction ids in display order.
    #[must_use]
    pub fn txids(&self) -> Vec<String> {
        self.block.txdata.iter().map(|tx| tx.compute_txid().to_string()).collect()
    }

    #[must_use]
    pub fn raw_transactions(&self) -> Vec<String> {
        self.block.txdata.iter().map(|tx| hex::encode(serialize(tx))).collect()
    }
}

fn transaction(previous_output: OutPoint, script_sig: Vec<u8>, value: u64) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }],
    }
}

/// Coinbase script starting with the minimal push of `height`.
fn bip34_script(height: u64) -> Vec<u8> {
    let mut number: Vec<u8> = height.to_le_bytes().into_iter().collect();
    while number.last() == Some(&0) {
        number.pop();
    }
    if number.last().is_some_and(|byte| byte & 0x80 != 0) {
        number.push(0);
    }

    let mut script = Vec::with_capacity(number.len() + 3);
    script.push(u8::try_from(number.len()).unwrap_or(0));
    script.extend_from_slice(&number);
    script.extend_from_slice(&[0x2f, 0x74, 0x2f]);
    script
}

/// Upstream settings with deadlines short enough for tests.
#[must_use]
pub fn test_upstream_config(default_server: &str) -> UpstreamConfig {
    UpstreamConfig {
        default_server: default_server.to_string(),
        connect_timeout_seconds: 2,
        request_timeout_seconds: 2,
        ..UpstreamConfig::default()
    }
}

/// P2P settings pointing at a local mock node.
#[must_use]
pub fn test_p2p_config(addr: SocketAddr) -> P2pConfig {
    P2pConfig {
        name: "test peer".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        network_magic: hex::encode(TEST_MAGIC),
        reconnect_delay_ms: 50,
        handshake_timeout_seconds: 2,
        block_timeout_seconds: 2,
        ..P2pConfig::default()
    }
}

/// Polls `condition` every 10ms until it holds or `deadline` passes.
pub async fn wait_until(deadline: std::time::Duration, condition: impl Fn() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while !condition() {
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    true
}
