//! Fork choice over the chain engine.
//!
//! The [`ChainManager`] owns the adopted chain plus a few competing fork
//! tips. Blocks arriving from the network are routed to whichever chain
//! they extend; a fork that becomes strictly longer than the adopted chain
//! is switched to with [`reorganize`].

use crate::block::types::Block;
use crate::chain::{reorganize, stored_branch, Chain, ChainError, ChainResult};
use crate::types::Hash256;
use tracing::{debug, info, warn};

/// Competing fork tips kept in memory
const MAX_TRACKED_FORKS: usize = 8;

/// Pluggable yes/no check on a block's transactions, consulted after the
/// proof-of-work and linkage rules pass.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, chain: &Chain, block: &Block) -> bool;
}

/// Validator that accepts any well-formed block.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ContentValidator for AcceptAll {
    fn validate(&self, _chain: &Chain, _block: &Block) -> bool {
        true
    }
}

impl<F> ContentValidator for F
where
    F: Fn(&Chain, &Block) -> bool + Send + Sync,
{
    fn validate(&self, chain: &Chain, block: &Block) -> bool {
        self(chain, block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Block extended the adopted chain
    Extended { height: u64 },
    /// Block extended or started a fork that is not (yet) longer
    ForkTracked { height: u64 },
    /// A fork overtook the adopted chain
    Reorganized {
        reverted: usize,
        applied: usize,
        height: u64,
    },
    /// Block is already stored and heads no untracked longer branch
    Known,
    /// Parent unknown; history must be requested from the sender
    Orphan { parent: Hash256 },
}

pub struct ChainManager {
    adopted: Chain,
    forks: Vec<Chain>,
}

impl ChainManager {
    pub fn new(adopted: Chain) -> Self {
        Self {
            adopted,
            forks: Vec::new(),
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.adopted
    }

    pub fn fork_count(&self) -> usize {
        self.forks.len()
    }

    pub fn submit(&mut self, block: Block) -> ChainResult<SubmitOutcome> {
        let hash = block.hash();
        let parent = block.header.prev_hash;

        if self.adopted.store().contains(&hash)? {
            return self.submit_stored(hash);
        }

        if parent == self.adopted.hash() {
            let next = self.adopted.extend(block)?;
            next.persist()?;
            self.adopted = next;
            self.prune_forks();
            return Ok(SubmitOutcome::Extended {
                height: self.adopted.height(),
            });
        }

        if let Some(idx) = self.forks.iter().position(|f| f.hash() == parent) {
            let fork = self.forks[idx].extend(block)?;
            self.forks[idx] = fork;
            return self.maybe_switch(idx);
        }

        // Parent is somewhere in the history of a chain we know, or on a
        // stored branch nobody tracks any more
        let base = if self.adopted.is_cached(&parent) {
            Some(&self.adopted)
        } else {
            self.forks.iter().find(|f| f.is_cached(&parent))
        };
        let at_parent = match base {
            Some(base) => Some(base.revert(&parent)?.1),
            None => match stored_branch(&self.adopted, &parent, 0) {
                Ok(branch) => branch,
                Err(ChainError::AncestorNotFound) => None,
                Err(e) => return Err(e),
            },
        };
        let Some(at_parent) = at_parent else {
            debug!("Orphan block {}, parent {}", hex::encode(hash), hex::encode(parent));
            return Ok(SubmitOutcome::Orphan { parent });
        };

        let fork = at_parent.extend(block)?;
        info!(
            "Tracking fork at height {} ({})",
            fork.height(),
            hex::encode(fork.hash())
        );
        self.forks.push(fork);
        let idx = self.forks.len() - 1;
        let outcome = self.maybe_switch(idx)?;
        self.prune_forks();
        Ok(outcome)
    }

    /// A block already in the store is new to us only if it heads a branch
    /// that is not tracked and is longer than the adopted chain, as after a
    /// restart or once its fork was pruned.
    fn submit_stored(&mut self, hash: Hash256) -> ChainResult<SubmitOutcome> {
        let tracked =
            self.adopted.is_cached(&hash) || self.forks.iter().any(|f| f.is_cached(&hash));
        if tracked {
            return Ok(SubmitOutcome::Known);
        }

        let branch = match stored_branch(&self.adopted, &hash, self.adopted.height() + 1) {
            Ok(Some(branch)) => branch,
            Ok(None) => return Ok(SubmitOutcome::Known),
            Err(e) if e.is_recoverable() => {
                debug!("Stored block {} not resumable: {}", hex::encode(hash), e);
                return Ok(SubmitOutcome::Known);
            }
            Err(e) => return Err(e),
        };

        info!(
            "Resuming stored branch at height {} ({})",
            branch.height(),
            hex::encode(hash)
        );
        self.forks.push(branch);
        let idx = self.forks.len() - 1;
        let outcome = self.maybe_switch(idx)?;
        self.prune_forks();
        Ok(outcome)
    }

    fn maybe_switch(&mut self, idx: usize) -> ChainResult<SubmitOutcome> {
        let fork_height = self.forks[idx].height();
        if fork_height <= self.adopted.height() {
            return Ok(SubmitOutcome::ForkTracked {
                height: fork_height,
            });
        }

        let reorg = reorganize(&self.adopted, &self.forks[idx])?;
        reorg.chain.persist()?;
        let previous = std::mem::replace(&mut self.adopted, reorg.chain);
        self.forks[idx] = previous;
        Ok(SubmitOutcome::Reorganized {
            reverted: reorg.reverted.len(),
            applied: reorg.applied.len(),
            height: self.adopted.height(),
        })
    }

    /// Drop forks that fell out of the cache window or exceed the cap.
    fn prune_forks(&mut self) {
        let height = self.adopted.height();
        let window = self.adopted.params().cache_window;
        self.forks.retain(|f| f.height().saturating_add(window) >= height);
        if self.forks.len() > MAX_TRACKED_FORKS {
            self.forks.sort_by_key(|f| std::cmp::Reverse(f.height()));
            let dropped = self.forks.len() - MAX_TRACKED_FORKS;
            self.forks.truncate(MAX_TRACKED_FORKS);
            warn!("Dropped {} stale fork tips", dropped);
        }
    }
}
