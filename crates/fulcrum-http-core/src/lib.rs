//! # Fulcrum HTTP Core
//!
//! Core library for an HTTP gateway in front of Electrum-protocol wallet servers.
//!
//! - **[`upstream`]**: Electrum client over WebSocket or TCP, and the per-server
//!   connection pool with idle eviction.
//! - **[`p2p`]**: self-reconnecting P2P peer used to download full blocks, with the
//!   wire codec and block decoder.
//! - **[`proxy`]**: request dispatcher and the `blockchain.block.get` reconstructor.
//! - **[`types`]**: request and response envelopes.
//! - **[`config`]**: layered configuration.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────┐
//! │ ProxyEngine │ ─── Malformed ──► Error Response
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐       ┌──────────┐
//! │ PoolManager │──────►│ Electrum │
//! └──────┬──────┘       └──────────┘
//!        │ block.get
//!        ▼
//! ┌─────────────┐       ┌──────────┐
//! │BlocksHandler│──────►│ P2pPeer  │
//! └─────────────┘       └──────────┘
//! ```

pub mod config;
pub mod p2p;
pub mod proxy;
pub mod types;
pub mod upstream;
pub mod utils;
