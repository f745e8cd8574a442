//! Chain engine behaviour across module boundaries: retargeting at the
//! interval boundary, fork choice and resuming from disk.

#[cfg(test)]
mod tests {
    use chaind::block::pow::{hash_meets_target, solve, target_from_bits, POW_LIMIT_BITS};
    use chaind::block::Block;
    use chaind::chain::{
        shared_root, BlockStore, Chain, ChainError, ChainParams, Rejection, GENESIS_TIMESTAMP,
    };
    use chaind::consensus::{AcceptAll, ChainManager, SubmitOutcome};
    use std::sync::Arc;

    fn params(interval: u64) -> Arc<ChainParams> {
        Arc::new(ChainParams {
            retarget_interval: interval,
            ..ChainParams::default()
        })
    }

    fn fresh_chain(params: Arc<ChainParams>) -> Chain {
        let store = Arc::new(BlockStore::temporary().unwrap());
        Chain::genesis(store, params, Arc::new(AcceptAll)).unwrap()
    }

    fn mined(chain: &Chain, n_bits: u64, timestamp: u64) -> Block {
        let mut block = Block::new(chain.hash(), n_bits, timestamp, vec![]);
        assert!(solve(&mut block, 5_000_000));
        block
    }

    /// Extend `chain` by `n` blocks spaced `spacing` seconds apart.
    fn build(chain: &Chain, n: u64, spacing: u64) -> (Chain, Vec<Block>) {
        let mut chain = chain.clone();
        let mut blocks = Vec::new();
        for _ in 0..n {
            let ts = chain.head().header.timestamp + spacing;
            let block = mined(&chain, chain.expected_bits().unwrap(), ts);
            blocks.push(block.clone());
            chain = chain.extend(block).unwrap();
        }
        (chain, blocks)
    }

    #[test]
    fn test_retarget_boundary_rejects_stale_bits() {
        let chain = fresh_chain(params(4));
        // Blocks one second apart: far faster than the 600s spacing
        let (chain, _) = build(&chain, 4, 1);
        assert_eq!(chain.height(), 4);

        let retargeted = chain.expected_bits().unwrap();
        assert_ne!(retargeted, POW_LIMIT_BITS);
        assert!(target_from_bits(retargeted).unwrap() < target_from_bits(POW_LIMIT_BITS).unwrap());

        // Solved against the old target, but carrying the stale n_bits
        let ts = chain.head().header.timestamp + 1;
        let stale = mined(&chain, POW_LIMIT_BITS, ts);
        assert!(hash_meets_target(&stale.hash(), POW_LIMIT_BITS));
        let err = chain.extend(stale).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected(Rejection::DifficultyMismatch { expected, actual })
                if expected == retargeted && actual == POW_LIMIT_BITS
        ));

        let fresh = mined(&chain, retargeted, ts);
        assert_eq!(chain.extend(fresh).unwrap().height(), 5);
    }

    #[test]
    fn test_no_retarget_off_boundary() {
        let chain = fresh_chain(params(4));
        let (chain, _) = build(&chain, 3, 1);
        assert_eq!(chain.expected_bits().unwrap(), POW_LIMIT_BITS);
    }

    #[test]
    fn test_slow_blocks_stay_at_limit() {
        let chain = fresh_chain(params(4));
        let (chain, _) = build(&chain, 4, 6_000);
        // Easier than the limit is capped at the limit
        assert_eq!(chain.expected_bits().unwrap(), POW_LIMIT_BITS);
    }

    #[tokio::test]
    async fn test_longer_fork_reorganizes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let params = params(2016);

        let store = Arc::new(BlockStore::open(&path).unwrap());
        let adopted =
            Chain::open(Arc::clone(&store), Arc::clone(&params), Arc::new(AcceptAll)).unwrap();
        let mut manager = ChainManager::new(adopted.clone());

        // Local chain: three blocks, mined on a scratch store so the
        // manager sees them as new
        let (_, local) = build(&fresh_chain(Arc::clone(&params)), 3, 600);
        for block in local {
            assert!(matches!(
                manager.submit(block).unwrap(),
                SubmitOutcome::Extended { .. }
            ));
        }

        // Competing chain from genesis, built elsewhere, five blocks
        let remote = fresh_chain(Arc::clone(&params));
        let (remote_tip, remote_blocks) = build(&remote, 5, 599);

        let mut outcomes = Vec::new();
        for block in remote_blocks {
            outcomes.push(manager.submit(block).unwrap());
        }
        assert!(matches!(outcomes[0], SubmitOutcome::ForkTracked { height: 1 }));
        assert!(matches!(
            outcomes[3],
            SubmitOutcome::Reorganized {
                reverted: 3,
                applied: 4,
                height: 4
            }
        ));
        assert!(matches!(outcomes[4], SubmitOutcome::Extended { height: 5 }));
        assert_eq!(manager.chain().hash(), remote_tip.hash());
        assert_eq!(
            shared_root(manager.chain(), &remote_tip).unwrap(),
            remote_tip.hash()
        );

        store.flush().await.unwrap();
        drop(manager);
        drop(adopted);
        drop(store);

        let store = Arc::new(BlockStore::open(&path).unwrap());
        let resumed = Chain::open(store, params, Arc::new(AcceptAll)).unwrap();
        assert_eq!(resumed.height(), 5);
        assert_eq!(resumed.hash(), remote_tip.hash());
    }

    #[tokio::test]
    async fn test_restart_resumes_stored_fork() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let params = params(2016);

        let (_, local) = build(&fresh_chain(Arc::clone(&params)), 3, 600);
        let (_, remote) = build(&fresh_chain(Arc::clone(&params)), 5, 599);

        let store = Arc::new(BlockStore::open(&path).unwrap());
        let adopted =
            Chain::open(Arc::clone(&store), Arc::clone(&params), Arc::new(AcceptAll)).unwrap();
        let mut manager = ChainManager::new(adopted);
        for block in local {
            manager.submit(block).unwrap();
        }
        for block in &remote[..2] {
            assert!(matches!(
                manager.submit(block.clone()).unwrap(),
                SubmitOutcome::ForkTracked { .. }
            ));
        }
        assert_eq!(manager.fork_count(), 1);

        // Restart: the fork tips are gone, its blocks are still on disk
        store.flush().await.unwrap();
        drop(manager);
        drop(store);
        let store = Arc::new(BlockStore::open(&path).unwrap());
        let resumed = Chain::open(store, Arc::clone(&params), Arc::new(AcceptAll)).unwrap();
        assert_eq!(resumed.height(), 3);
        let mut manager = ChainManager::new(resumed);
        assert_eq!(manager.fork_count(), 0);

        let mut outcomes = Vec::new();
        for block in remote.clone() {
            outcomes.push(manager.submit(block).unwrap());
        }
        assert_eq!(outcomes[0], SubmitOutcome::Known);
        assert_eq!(outcomes[1], SubmitOutcome::Known);
        assert_eq!(outcomes[2], SubmitOutcome::ForkTracked { height: 3 });
        assert_eq!(
            outcomes[3],
            SubmitOutcome::Reorganized {
                reverted: 3,
                applied: 4,
                height: 4
            }
        );
        assert_eq!(outcomes[4], SubmitOutcome::Extended { height: 5 });
        assert_eq!(manager.chain().height(), 5);
        assert_eq!(manager.chain().hash(), remote[4].hash());
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = fresh_chain(params(2016));
        let b = fresh_chain(params(2016));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.head().header.timestamp, GENESIS_TIMESTAMP);
    }
}
