//! Content-addressed block store backed by sled.
//!
//! Blocks are written once under their hash and never removed, so a
//! reverted chain can always be replayed from the store.

use crate::block::types::Block;
use crate::chain::error::ChainResult;
use crate::types::Hash256;
use std::path::Path;

const BLOCKS_TREE: &str = "blocks";
const META_TREE: &str = "meta";
const HEAD_KEY: &[u8] = b"head";

pub struct BlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    meta: sled::Tree,
}

impl BlockStore {
    pub fn open(path: impl AsRef<Path>) -> ChainResult<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Self::from_db(db)
    }

    /// Store that lives only as long as the process; used by tests.
    pub fn temporary() -> ChainResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> ChainResult<Self> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self { db, blocks, meta })
    }

    /// Idempotent: an existing entry under the same hash is left alone.
    pub fn put(&self, block: &Block) -> ChainResult<Hash256> {
        let hash = block.hash();
        if !self.blocks.contains_key(hash)? {
            let bytes = bincode::serialize(block)?;
            self.blocks.insert(hash, bytes)?;
        }
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash256) -> ChainResult<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> ChainResult<bool> {
        Ok(self.blocks.contains_key(hash)?)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn write_pointer(&self, bytes: &[u8]) -> ChainResult<()> {
        self.meta.insert(HEAD_KEY, bytes)?;
        Ok(())
    }

    pub fn read_pointer(&self) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.meta.get(HEAD_KEY)?.map(|v| v.to_vec()))
    }

    pub async fn flush(&self) -> ChainResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
