//! The adopted-chain value: head, height and a bounded cache of recent
//! blocks, with validation and extension rules.

use crate::block::pow::{hash_meets_target, retarget_bits};
use crate::block::types::Block;
use crate::chain::error::{ChainError, ChainResult, Rejection};
use crate::chain::store::BlockStore;
use crate::chain::{ChainParams, GENESIS_TIMESTAMP};
use crate::consensus::ContentValidator;
use crate::types::{Hash256, ZERO_HASH};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Serialized pointer: height (8 bytes BE) ++ head hash.
pub const POINTER_LEN: usize = 8 + 32;

#[derive(Clone)]
pub struct Chain {
    hash: Hash256,
    head: Arc<Block>,
    height: u64,
    cache: HashMap<Hash256, (u64, Arc<Block>)>,
    store: Arc<BlockStore>,
    params: Arc<ChainParams>,
    validator: Arc<dyn ContentValidator>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("hash", &hex::encode(self.hash))
            .field("height", &self.height)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// The deterministic genesis block for a pow limit.
pub fn genesis_block(params: &ChainParams) -> Block {
    Block::new(ZERO_HASH, params.pow_limit_bits, GENESIS_TIMESTAMP, vec![])
}

impl Chain {
    /// Write the genesis block and return the height-0 chain.
    pub fn genesis(
        store: Arc<BlockStore>,
        params: Arc<ChainParams>,
        validator: Arc<dyn ContentValidator>,
    ) -> ChainResult<Self> {
        let block = genesis_block(&params);
        let hash = store.put(&block)?;
        let head = Arc::new(block);
        let mut cache = HashMap::new();
        cache.insert(hash, (0, Arc::clone(&head)));

        let chain = Self {
            hash,
            head,
            height: 0,
            cache,
            store,
            params,
            validator,
        };
        chain.persist()?;
        info!("Initialized chain at genesis {}", hex::encode(hash));
        Ok(chain)
    }

    /// Resume from the stored chain pointer, or start at genesis when the
    /// store has none.
    pub fn open(
        store: Arc<BlockStore>,
        params: Arc<ChainParams>,
        validator: Arc<dyn ContentValidator>,
    ) -> ChainResult<Self> {
        match store.read_pointer()? {
            Some(bytes) => {
                let chain = Self::deserialize(&bytes, store, params, validator)?;
                info!(
                    "Resumed chain at height {} ({})",
                    chain.height,
                    hex::encode(chain.hash)
                );
                Ok(chain)
            }
            None => Self::genesis(store, params, validator),
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn head(&self) -> &Arc<Block> {
        &self.head
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_cached(&self, hash: &Hash256) -> bool {
        self.cache.contains_key(hash)
    }

    /// Height of a cached block.
    pub fn cached_height(&self, hash: &Hash256) -> Option<u64> {
        self.cache.get(hash).map(|(h, _)| *h)
    }

    pub(crate) fn cache_entries(&self) -> impl Iterator<Item = (&Hash256, &(u64, Arc<Block>))> {
        self.cache.iter()
    }

    /// Cache first, then the store.
    pub fn block(&self, hash: &Hash256) -> ChainResult<Option<Arc<Block>>> {
        if let Some((_, block)) = self.cache.get(hash) {
            return Ok(Some(Arc::clone(block)));
        }
        Ok(self.store.get(hash)?.map(Arc::new))
    }

    fn require_block(&self, hash: &Hash256) -> ChainResult<Arc<Block>> {
        self.block(hash)?.ok_or(ChainError::MissingBlock(*hash))
    }

    /// Block on this chain's path at `height`, chasing `prev_hash` from the
    /// head.
    pub fn ancestor_at(&self, height: u64) -> ChainResult<Arc<Block>> {
        if height > self.height {
            return Err(ChainError::AncestorNotFound);
        }
        let mut block = Arc::clone(&self.head);
        for _ in height..self.height {
            block = self.require_block(&block.header.prev_hash)?;
        }
        Ok(block)
    }

    /// Difficulty the next block must carry.
    pub fn expected_bits(&self) -> ChainResult<u64> {
        let interval = self.params.retarget_interval;
        let h = self.height;
        if interval == 0 || h == 0 || h % interval != 0 {
            return Ok(self.head.header.n_bits);
        }

        let reference = self.ancestor_at(h - interval)?;
        let actual = self
            .head
            .header
            .timestamp
            .saturating_sub(reference.header.timestamp);
        let bits = retarget_bits(
            self.head.header.n_bits,
            actual,
            self.params.expected_timespan(),
            self.params.pow_limit_bits,
        );
        debug!(
            "Retarget at height {}: timespan {}s, n_bits {:#x} -> {:#x}",
            h,
            actual,
            self.head.header.n_bits,
            bits
        );
        Ok(bits)
    }

    /// Validate `candidate` against this head and return the extended chain.
    /// `self` is left untouched whatever the outcome.
    pub fn extend(&self, candidate: Block) -> ChainResult<Chain> {
        if candidate.header.prev_hash != self.hash {
            return Err(Rejection::ParentMismatch.into());
        }

        let expected = self.expected_bits()?;
        if candidate.header.n_bits != expected {
            return Err(Rejection::DifficultyMismatch {
                expected,
                actual: candidate.header.n_bits,
            }
            .into());
        }

        let hash = candidate.hash();
        if !hash_meets_target(&hash, expected) {
            return Err(Rejection::InsufficientWork.into());
        }

        if !candidate.is_well_formed() || !self.validator.validate(self, &candidate) {
            return Err(Rejection::ContentRejected.into());
        }

        self.store.put(&candidate)?;

        let height = self.height + 1;
        let head = Arc::new(candidate);
        let mut next = self.with_head(hash, Arc::clone(&head), height);
        next.cache.insert(hash, (height, head));
        let window = self.params.cache_window;
        next.cache.retain(|h, (entry_height, _)| {
            *h == hash || entry_height.saturating_add(window) >= height
        });

        debug!("Extended chain to height {} ({})", height, hex::encode(hash));
        Ok(next)
    }

    fn with_head(&self, hash: Hash256, head: Arc<Block>, height: u64) -> Chain {
        Chain {
            hash,
            head,
            height,
            cache: self.cache.clone(),
            store: Arc::clone(&self.store),
            params: Arc::clone(&self.params),
            validator: Arc::clone(&self.validator),
        }
    }

    /// Grow the cache backward by up to `extend_step` blocks from its
    /// oldest entry whose parent is not cached. Returns how many blocks
    /// were added; zero at genesis or when the store lacks the parent.
    pub(crate) fn grow_cache(&mut self) -> ChainResult<usize> {
        let frontier = self
            .cache
            .values()
            .filter(|(_, b)| !b.is_genesis() && !self.cache.contains_key(&b.header.prev_hash))
            .min_by_key(|(h, _)| *h)
            .map(|(h, b)| (*h, Arc::clone(b)));

        let Some((mut height, mut block)) = frontier else {
            return Ok(0);
        };

        let mut added = 0;
        while added < self.params.extend_step && !block.is_genesis() && height > 0 {
            let parent_hash = block.header.prev_hash;
            let Some(parent) = self.store.get(&parent_hash)? else {
                break;
            };
            height -= 1;
            block = Arc::new(parent);
            self.cache.insert(parent_hash, (height, Arc::clone(&block)));
            added += 1;
        }
        Ok(added)
    }

    /// Copy of this chain with a cache grown by one step.
    pub fn extend_cache(&self) -> ChainResult<Chain> {
        let mut next = self.clone();
        next.grow_cache()?;
        Ok(next)
    }

    /// Walk back from the head to `target`, returning the walked blocks
    /// (most recent first) and the chain whose head is `target`.
    pub fn revert(&self, target: &Hash256) -> ChainResult<(Vec<Arc<Block>>, Chain)> {
        let mut reverted = Vec::new();
        let mut block = Arc::clone(&self.head);
        let mut hash = self.hash;
        let mut height = self.height;

        while hash != *target {
            if block.is_genesis() || height == 0 {
                return Err(ChainError::AncestorNotFound);
            }
            let parent_hash = block.header.prev_hash;
            let parent = self.require_block(&parent_hash)?;
            reverted.push(block);
            block = parent;
            hash = parent_hash;
            height -= 1;
        }

        let mut chain = self.with_head(hash, Arc::clone(&block), height);
        chain.cache.clear();
        chain.cache.insert(hash, (height, block));
        chain.grow_cache()?;
        Ok((reverted, chain))
    }

    /// Adopted-chain blocks after `start` (oldest first), at most `limit`.
    /// An unknown or absent `start` means "after genesis".
    pub fn blocks_after(&self, start: Option<&Hash256>, limit: usize) -> ChainResult<Vec<Block>> {
        let mut path = Vec::new();
        let mut block = Arc::clone(&self.head);
        let mut hash = self.hash;
        while !block.is_genesis() && Some(&hash) != start {
            let parent_hash = block.header.prev_hash;
            let parent = self.require_block(&parent_hash)?;
            path.push(block);
            block = parent;
            hash = parent_hash;
        }
        Ok(path
            .into_iter()
            .rev()
            .take(limit)
            .map(|b| b.as_ref().clone())
            .collect())
    }

    pub fn serialize(&self) -> [u8; POINTER_LEN] {
        let mut out = [0u8; POINTER_LEN];
        out[..8].copy_from_slice(&self.height.to_be_bytes());
        out[8..].copy_from_slice(&self.hash);
        out
    }

    /// Rebuild a chain from its pointer, reloading the head from the store
    /// and rehydrating enough cache for retargeting.
    pub fn deserialize(
        bytes: &[u8],
        store: Arc<BlockStore>,
        params: Arc<ChainParams>,
        validator: Arc<dyn ContentValidator>,
    ) -> ChainResult<Self> {
        if bytes.len() != POINTER_LEN {
            return Err(ChainError::CorruptPointer(bytes.len()));
        }
        let mut height_bytes = [0u8; 8];
        height_bytes.copy_from_slice(&bytes[..8]);
        let height = u64::from_be_bytes(height_bytes);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..]);

        let head = Arc::new(store.get(&hash)?.ok_or(ChainError::MissingBlock(hash))?);
        let mut cache = HashMap::new();
        cache.insert(hash, (height, Arc::clone(&head)));

        let mut chain = Self {
            hash,
            head,
            height,
            cache,
            store,
            params,
            validator,
        };
        let wanted = chain.params.retarget_interval.min(chain.params.cache_window) as usize + 1;
        while chain.cache.len() < wanted {
            if chain.grow_cache()? == 0 {
                break;
            }
        }
        Ok(chain)
    }

    /// Record this chain as the adopted one in the store.
    pub fn persist(&self) -> ChainResult<()> {
        self.store.write_pointer(&self.serialize())
    }
}
