//! Upstream Electrum server connections.
//!
//! This module handles communication with wallet-query (Electrum protocol) servers:
//! - The [`UpstreamClient`] / [`UpstreamConnector`] seam the rest of the crate talks to
//! - [`ElectrumClient`], speaking JSON-RPC over WebSocket or line-delimited TCP
//! - [`PoolManager`], one lazily created connection per server key with idle eviction
//!
//! ## Example Flow
//!
//! ```text
//! get_client("wss://host:50004")
//!     │
//!     ├─ entry exists and is alive → touch, return it
//!     │
//!     ├─ entry exists but is dead  → discard, reconnect
//!     │
//!     └─ no entry → single-flight connect → server.version → store + arm idle watcher
//! ```

pub mod client;
pub mod electrum;
pub mod errors;
pub mod pool;

pub use client::{UpstreamClient, UpstreamConnector};
pub use electrum::{ElectrumClient, ElectrumConnector};
pub use errors::UpstreamError;
pub use pool::{PoolEntry, PoolManager, PooledClient};
