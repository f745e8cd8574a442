//! Chain-specific error types
//!
//! Rejections of candidate blocks are routine and carry a typed reason;
//! everything else is a failure of the local store or of the request.

use crate::types::Hash256;
use thiserror::Error;

/// Why `extend` refused a candidate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Block hash exceeds the target encoded by the expected `n_bits`
    InsufficientWork,
    /// Block carries a different `n_bits` than the chain expects
    DifficultyMismatch { expected: u64, actual: u64 },
    /// Block does not build on the chain head
    ParentMismatch,
    /// Transaction contents refused by the content validator
    ContentRejected,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InsufficientWork => write!(f, "hash above target"),
            Rejection::DifficultyMismatch { expected, actual } => {
                write!(f, "n_bits {:#x} expected {:#x}", actual, expected)
            }
            Rejection::ParentMismatch => write!(f, "prev_hash does not match head"),
            Rejection::ContentRejected => write!(f, "content rejected"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Block rejected: {0}")]
    Rejected(Rejection),

    /// No common block found within the search bound
    #[error("Shared ancestor not found")]
    AncestorNotFound,

    #[error("Block {} missing from store", hex::encode(.0))]
    MissingBlock(Hash256),

    #[error("Corrupt chain pointer ({0} bytes)")]
    CorruptPointer(usize),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    /// Routine outcomes: a peer sent something we do not want or cannot
    /// place yet. The node keeps running and the peer stays connected.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChainError::Rejected(_) | ChainError::AncestorNotFound | ChainError::MissingBlock(_)
        )
    }
}

impl From<Rejection> for ChainError {
    fn from(r: Rejection) -> Self {
        ChainError::Rejected(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChainError::Rejected(Rejection::ParentMismatch).is_recoverable());
        assert!(ChainError::AncestorNotFound.is_recoverable());

        let storage_err = ChainError::Storage(sled::Error::Io(std::io::Error::other("test")));
        assert!(!storage_err.is_recoverable());
        assert!(!ChainError::CorruptPointer(3).is_recoverable());
    }

    #[test]
    fn test_rejection_display() {
        let err: ChainError = Rejection::DifficultyMismatch {
            expected: 0x1d00ffff,
            actual: 0x207fffff,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Block rejected: n_bits 0x207fffff expected 0x1d00ffff"
        );
    }
}
