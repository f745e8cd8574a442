//! Proof-of-work ledger peer node: framed peer networking plus a chain
//! consensus engine with retargeting and fork resolution.

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod error;
pub mod network;
pub mod node;
pub mod peer_directory;
pub mod shutdown;
pub mod types;
