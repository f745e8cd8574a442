use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxIn {
    pub txid: Hash256,
    pub out_index: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOut {
    pub amount: u64,
    pub address: Vec<u8>,
}

/// Opaque to the consensus core: only carried, hashed into the merkle root
/// and handed to the content validator.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub outs: Vec<TxOut>,
    pub ins: Vec<TxIn>,
    pub sigs: Vec<Vec<u8>>,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("Serialization should succeed");
        Sha256::digest(bytes).into()
    }
}

/// Seconds since the unix epoch, saturating to zero on a clock before 1970.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txid_depends_on_contents() {
        let a = Transaction {
            outs: vec![TxOut {
                amount: 5,
                address: b"alice".to_vec(),
            }],
            ins: vec![],
            sigs: vec![],
        };
        let mut b = a.clone();
        b.outs[0].amount = 6;

        assert_eq!(a.txid(), a.clone().txid());
        assert_ne!(a.txid(), b.txid());
    }
}
