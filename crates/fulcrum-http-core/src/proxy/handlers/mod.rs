//! Handlers for methods the gateway serves itself instead of forwarding.

pub mod blocks;

pub use blocks::{BlockRecord, BlocksHandler, Verbosity};
