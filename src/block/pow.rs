//! Proof-of-work targets.
//!
//! `n_bits` is the usual compact encoding: the high byte is a base-256
//! exponent, the low 23 bits a mantissa, bit 23 a sign flag that must be
//! clear. Targets are compared with block hashes as 32-byte big-endian
//! strings; a lower target is harder.

use crate::block::types::{Block, BlockHeader};
use crate::types::Hash256;
use num_bigint::BigUint;

/// Easiest permitted target: roughly every second hash qualifies.
pub const POW_LIMIT_BITS: u64 = 0x207f_ffff;

fn decode_compact(n_bits: u64) -> Option<BigUint> {
    if n_bits > u32::MAX as u64 || n_bits & 0x0080_0000 != 0 {
        return None;
    }
    let size = ((n_bits >> 24) & 0xff) as usize;
    let word = (n_bits & 0x007f_ffff) as u32;
    let target = if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    };
    if target == BigUint::from(0u32) || target.bits() > 256 {
        return None;
    }
    Some(target)
}

fn encode_compact(target: &BigUint) -> u64 {
    if target.bits() == 0 {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u64;
    let mut word = bytes
        .iter()
        .take(3)
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);
    if size < 3 {
        word <<= 8 * (3 - size);
    }
    // Keep the sign bit clear by widening the exponent
    if word & 0x0080_0000 != 0 {
        word >>= 8;
        size += 1;
    }
    (word & 0x007f_ffff) | (size << 24)
}

fn to_hash(target: &BigUint) -> Option<Hash256> {
    let bytes = target.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(out)
}

/// Expand compact bits into a 32-byte big-endian target. `None` for
/// negative, zero or overflowing encodings.
pub fn target_from_bits(n_bits: u64) -> Option<Hash256> {
    decode_compact(n_bits).as_ref().and_then(to_hash)
}

/// Compress a 32-byte big-endian target into compact bits.
pub fn bits_from_target(target: &Hash256) -> u64 {
    encode_compact(&BigUint::from_bytes_be(target))
}

/// True when `hash` does not exceed the target encoded by `n_bits`.
pub fn hash_meets_target(hash: &Hash256, n_bits: u64) -> bool {
    match target_from_bits(n_bits) {
        Some(target) => hash.as_slice() <= target.as_slice(),
        None => false,
    }
}

pub fn check_proof_of_work(header: &BlockHeader) -> bool {
    hash_meets_target(&header.hash(), header.n_bits)
}

/// Scale the previous target by how long the last retarget window actually
/// took. The timespan is clamped to a factor of four either way and the
/// result never exceeds the pow limit.
pub fn retarget_bits(
    prev_bits: u64,
    actual_timespan: u64,
    expected_timespan: u64,
    pow_limit_bits: u64,
) -> u64 {
    let expected = expected_timespan.max(1);
    let actual = actual_timespan.clamp(expected / 4, expected.saturating_mul(4)).max(1);

    let prev = match decode_compact(prev_bits) {
        Some(prev) => prev,
        None => return pow_limit_bits,
    };
    let limit = decode_compact(pow_limit_bits)
        .unwrap_or_else(|| (BigUint::from(1u32) << 256) - BigUint::from(1u32));

    let next = prev * BigUint::from(actual) / BigUint::from(expected);
    if next > limit {
        pow_limit_bits
    } else if next == BigUint::from(0u32) {
        encode_compact(&BigUint::from(1u32))
    } else {
        encode_compact(&next)
    }
}

/// Best-effort nonce search. Returns false if `max_tries` nonces were tried
/// without meeting the target.
pub fn solve(block: &mut Block, max_tries: u64) -> bool {
    for _ in 0..max_tries {
        if check_proof_of_work(&block.header) {
            return true;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    check_proof_of_work(&block.header)
}
