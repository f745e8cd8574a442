//! Benchmarks for header hashing and chain extension
//!
//! Run with: cargo bench

use chaind::block::pow::solve;
use chaind::block::Block;
use chaind::chain::{BlockStore, Chain, ChainParams, GENESIS_TIMESTAMP};
use chaind::consensus::AcceptAll;
use chaind::types::{Transaction, TxIn, TxOut};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

fn genesis_chain() -> Chain {
    let store = Arc::new(BlockStore::temporary().unwrap());
    Chain::genesis(store, Arc::new(ChainParams::default()), Arc::new(AcceptAll)).unwrap()
}

fn sample_transactions(n: usize) -> Vec<Transaction> {
    (0..n)
        .map(|i| Transaction {
            outs: vec![TxOut {
                amount: i as u64,
                address: vec![i as u8; 20],
            }],
            ins: vec![TxIn {
                txid: [i as u8; 32],
                out_index: 0,
            }],
            sigs: vec![vec![0u8; 64]],
        })
        .collect()
}

fn bench_header_hash(c: &mut Criterion) {
    let block = Block::new([1u8; 32], 0x207f_ffff, GENESIS_TIMESTAMP, sample_transactions(10));

    c.bench_function("header_hash", |b| {
        b.iter(|| black_box(&block).hash())
    });
}

fn bench_extend(c: &mut Criterion) {
    let chain = genesis_chain();
    let bits = chain.expected_bits().unwrap();
    let mut block = Block::new(chain.hash(), bits, GENESIS_TIMESTAMP + 600, sample_transactions(50));
    assert!(solve(&mut block, 1_000_000));

    // Re-extending the same head writes the same key, so the store stays small
    c.bench_function("extend_50_txs", |b| {
        b.iter_batched(
            || block.clone(),
            |candidate| chain.extend(black_box(candidate)).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_header_hash, bench_extend);
criterion_main!(benches);
