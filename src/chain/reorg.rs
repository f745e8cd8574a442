//! Shared-ancestor search and chain reorganization.

use crate::block::types::Block;
use crate::chain::error::{ChainError, ChainResult};
use crate::chain::state::Chain;
use crate::types::Hash256;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of switching from one chain to another.
#[derive(Debug)]
pub struct Reorg {
    /// Blocks removed from the old chain, most recent first
    pub reverted: Vec<Arc<Block>>,
    /// Blocks replayed from the new chain, oldest first
    pub applied: Vec<Arc<Block>>,
    pub chain: Chain,
}

fn highest_common(a: &Chain, b: &Chain) -> Option<(u64, Hash256)> {
    a.cache_entries()
        .filter(|(hash, _)| b.is_cached(hash))
        .map(|(hash, (height, _))| (*height, *hash))
        .max_by_key(|(height, _)| *height)
}

/// Highest block of `a`'s cache that is also in `b`'s cache. Both caches are
/// grown on clones until a common block appears; the inputs are untouched.
pub fn shared_root(a: &Chain, b: &Chain) -> ChainResult<Hash256> {
    if a.hash() == b.hash() {
        return Ok(a.hash());
    }

    let mut a = a.clone();
    let mut b = b.clone();
    let attempts = a.params().max_ancestor_attempts;

    for round in 0..=attempts {
        if let Some((height, hash)) = highest_common(&a, &b) {
            debug!(
                "Shared root at height {} after {} rounds: {}",
                height,
                round,
                hex::encode(hash)
            );
            return Ok(hash);
        }
        if round == attempts {
            break;
        }
        let grown = a.grow_cache()? + b.grow_cache()?;
        if grown == 0 {
            break;
        }
    }
    Err(ChainError::AncestorNotFound)
}

/// Switch from `current` to `candidate`: revert `current` to the shared
/// root and replay `candidate`'s blocks above it through `extend`.
pub fn reorganize(current: &Chain, candidate: &Chain) -> ChainResult<Reorg> {
    let root = shared_root(current, candidate)?;
    let (reverted, base) = current.revert(&root)?;
    let (mut applied, _) = candidate.revert(&root)?;
    applied.reverse();

    let mut chain = base;
    for block in &applied {
        chain = chain.extend(block.as_ref().clone())?;
    }

    info!(
        "Reorganized at {}: reverted {}, applied {}, new height {}",
        hex::encode(root),
        reverted.len(),
        applied.len(),
        chain.height()
    );
    Ok(Reorg {
        reverted,
        applied,
        chain,
    })
}

/// Rebuild the chain whose head is the stored block `tip`. Parents are
/// chased through the store until the walk meets `base`'s cache (grown on
/// a clone as the walk deepens), then the walked blocks are replayed
/// through `extend`. `None` when part of the branch is not stored, or when
/// the branch would end below `min_height` (nothing is replayed then).
pub fn stored_branch(
    base: &Chain,
    tip: &Hash256,
    min_height: u64,
) -> ChainResult<Option<Chain>> {
    let mut base = base.clone();
    let mut attempts = base.params().max_ancestor_attempts;
    let reach = base.params().cache_window as usize
        + base.params().extend_step.saturating_mul(attempts);
    let mut path = Vec::new();
    let mut hash = *tip;

    while !base.is_cached(&hash) {
        if attempts > 0 {
            attempts -= 1;
            if base.grow_cache()? > 0 && base.is_cached(&hash) {
                break;
            }
        }
        if path.len() > reach {
            return Err(ChainError::AncestorNotFound);
        }
        let Some(block) = base.store().get(&hash)? else {
            return Ok(None);
        };
        // Genesis not reached by the base cache: different network or out of reach
        if block.is_genesis() {
            return Err(ChainError::AncestorNotFound);
        }
        hash = block.header.prev_hash;
        path.push(block);
    }

    let root_height = base.cached_height(&hash).unwrap_or(0);
    if root_height + (path.len() as u64) < min_height {
        return Ok(None);
    }

    let (_, mut chain) = base.revert(&hash)?;
    for block in path.into_iter().rev() {
        chain = chain.extend(block)?;
    }
    debug!(
        "Rebuilt stored branch at height {} ({}) from root {}",
        chain.height(),
        hex::encode(chain.hash()),
        hex::encode(hash)
    );
    Ok(Some(chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::pow::solve;
    use crate::chain::{BlockStore, ChainParams, GENESIS_TIMESTAMP};
    use crate::consensus::AcceptAll;

    fn new_chain(params: ChainParams) -> Chain {
        let store = Arc::new(BlockStore::temporary().unwrap());
        Chain::genesis(store, Arc::new(params), Arc::new(AcceptAll)).unwrap()
    }

    /// Extend `chain` by `n` blocks; `salt` keeps sibling branches distinct.
    fn grow(chain: &Chain, n: u64, salt: u64) -> Chain {
        let mut chain = chain.clone();
        for _ in 0..n {
            let bits = chain.expected_bits().unwrap();
            let ts = chain.head().header.timestamp + 600 + salt;
            let mut block = Block::new(chain.hash(), bits, ts, vec![]);
            assert!(solve(&mut block, 1_000_000));
            chain = chain.extend(block).unwrap();
        }
        chain
    }

    #[test]
    fn test_shared_root_of_self_is_head() {
        let chain = grow(&new_chain(ChainParams::default()), 3, 0);
        let cached = chain.cache_len();
        assert_eq!(shared_root(&chain, &chain).unwrap(), chain.hash());
        assert_eq!(chain.cache_len(), cached);
    }

    #[test]
    fn test_shared_root_grows_past_window() {
        let params = ChainParams {
            cache_window: 2,
            extend_step: 3,
            ..ChainParams::default()
        };
        let base = grow(&new_chain(params), 5, 0);
        let a = grow(&base, 6, 0);
        let b = grow(&base, 4, 1);
        assert!(!a.is_cached(&base.hash()));

        assert_eq!(shared_root(&a, &b).unwrap(), base.hash());
        assert_eq!(shared_root(&b, &a).unwrap(), base.hash());
        // Inputs untouched
        assert_eq!(a.cache_len(), 3);
    }

    #[test]
    fn test_shared_root_is_bounded() {
        let params = ChainParams {
            cache_window: 1,
            extend_step: 1,
            max_ancestor_attempts: 2,
            ..ChainParams::default()
        };
        let base = new_chain(params);
        let a = grow(&base, 10, 0);
        let b = grow(&base, 10, 1);

        let err = shared_root(&a, &b).unwrap_err();
        assert!(matches!(err, ChainError::AncestorNotFound));
    }

    #[test]
    fn test_shared_root_unrelated_stores() {
        let a = grow(&new_chain(ChainParams::default()), 2, 0);
        let params = ChainParams {
            pow_limit_bits: 0x2000_ffff,
            ..ChainParams::default()
        };
        let b = grow(&new_chain(params), 2, 0);
        let err = shared_root(&a, &b).unwrap_err();
        assert!(matches!(err, ChainError::AncestorNotFound));
    }

    #[test]
    fn test_reorganize_to_longer_branch() {
        let base = grow(&new_chain(ChainParams::default()), 3, 0);
        let current = grow(&base, 2, 0);
        let candidate = grow(&base, 4, 1);

        let reorg = reorganize(&current, &candidate).unwrap();
        assert_eq!(reorg.reverted.len(), 2);
        assert_eq!(reorg.applied.len(), 4);
        assert_eq!(reorg.chain.hash(), candidate.hash());
        assert_eq!(reorg.chain.height(), 7);
        assert_eq!(reorg.applied[0].header.prev_hash, base.hash());
        // The old value is still usable
        assert_eq!(current.height(), 5);
    }

    #[test]
    fn test_stored_branch_rebuilds_untracked_fork() {
        let params = ChainParams {
            cache_window: 2,
            extend_step: 3,
            ..ChainParams::default()
        };
        let base = grow(&new_chain(params), 3, 0);
        let side = grow(&base, 4, 1);
        // Adopted chain moved on past the fork point and out of the window
        let adopted = grow(&base, 5, 0);
        assert!(!adopted.is_cached(&base.hash()));

        assert!(stored_branch(&adopted, &side.hash(), 9).unwrap().is_none());
        let rebuilt = stored_branch(&adopted, &side.hash(), 0).unwrap().unwrap();
        assert_eq!(rebuilt.hash(), side.hash());
        assert_eq!(rebuilt.height(), 7);
        assert!(rebuilt.is_cached(&side.hash()));
    }

    #[test]
    fn test_stored_branch_missing_block() {
        let chain = grow(&new_chain(ChainParams::default()), 2, 0);
        assert!(stored_branch(&chain, &[7u8; 32], 0).unwrap().is_none());
    }
}
