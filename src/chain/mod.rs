//! Chain store and consensus engine.
//!
//! A [`Chain`] is an immutable value: extending, reverting or reorganizing
//! returns a new one and leaves the old one usable. All of them share one
//! append-only [`BlockStore`].

pub mod error;
pub mod reorg;
pub mod state;
pub mod store;

pub use error::{ChainError, ChainResult, Rejection};
pub use reorg::{reorganize, shared_root, stored_branch, Reorg};
pub use state::Chain;
pub use store::BlockStore;

use crate::block::pow::POW_LIMIT_BITS;

/// Timestamp of the deterministic genesis block.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    /// Blocks between difficulty adjustments
    pub retarget_interval: u64,
    /// Desired seconds between blocks
    pub target_spacing_secs: u64,
    /// Cached blocks kept below the head
    pub cache_window: u64,
    /// Blocks loaded per backward cache extension
    pub extend_step: usize,
    /// Cache growth rounds before shared-ancestor search gives up
    pub max_ancestor_attempts: usize,
    pub pow_limit_bits: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            retarget_interval: 2016,
            target_spacing_secs: 600,
            cache_window: 2048,
            extend_step: 25,
            max_ancestor_attempts: 100,
            pow_limit_bits: POW_LIMIT_BITS,
        }
    }
}

impl ChainParams {
    pub fn expected_timespan(&self) -> u64 {
        self.retarget_interval.saturating_mul(self.target_spacing_secs)
    }
}
