//! Request dispatching.
//!
//! # Main Components
//!
//! - `ProxyEngine`: parses calls, picks the upstream server and routes the call
//! - `ProxyError`: the single failure type surfaced in response envelopes
//! - `BlocksHandler`: serves `blockchain.block.get` from the P2P peer
//!
//! # Request Processing Flow
//!
//! ```text
//! HTTP body
//!     │
//!     ▼
//! ┌──────────────┐
//! │ RpcRequest   │ ─── no method ──► "Malformed request"
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ PoolManager  │ ─── connect error ──► failure envelope
//! │ get_client   │
//! └──────┬───────┘
//!        │
//!   ┌────┴─────────────────────┐
//!   ▼                          ▼
//! blockchain.block.get      any other method
//!   │                          │
//!   ▼                          ▼
//! BlocksHandler             forwarded verbatim
//! (header.get + P2P)
//! ```

pub mod engine;
pub mod errors;
pub mod handlers;

pub use engine::{ProxyEngine, SharedContext};
pub use errors::ProxyError;
pub use handlers::{BlockRecord, BlocksHandler, Verbosity};
