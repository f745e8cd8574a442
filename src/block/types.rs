//! Block types for the ledger.
//!
//! A block is immutable once built. Its identity is the SHA-256 of the
//! bincode-encoded header, so two blocks with equal headers are the same
//! block regardless of how their transactions were transported.

use crate::types::{Hash256, Transaction, ZERO_HASH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub nonce: u64,
    /// Compact proof-of-work target, see [`crate::block::pow`].
    pub n_bits: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub transactions_count: u32,
}

impl Block {
    /// Build an unsolved block (nonce 0) on top of `prev_hash`.
    pub fn new(
        prev_hash: Hash256,
        n_bits: u64,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = calculate_merkle_root(&transactions);
        let transactions_count = transactions.len() as u32;
        Self {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root,
                nonce: 0,
                n_bits,
                timestamp,
            },
            transactions,
            transactions_count,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_hash == ZERO_HASH
    }

    /// Check that the transaction count and merkle root agree with the
    /// transaction list carried by the block.
    pub fn is_well_formed(&self) -> bool {
        self.transactions_count as usize == self.transactions.len()
            && self.header.merkle_root == calculate_merkle_root(&self.transactions)
    }
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("BlockHeader serialization must not fail");
        Sha256::digest(bytes).into()
    }
}

/// Merkle root over transaction ids in block order. An empty list hashes to
/// the zero hash; odd levels duplicate their last entry.
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return ZERO_HASH;
    }

    let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for chunk in hashes.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next_level.push(hasher.finalize().into());
        }
        hashes = next_level;
    }

    hashes[0]
}
