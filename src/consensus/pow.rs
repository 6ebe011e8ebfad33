// Proof of work engine

use crate::core::{Block, Hash256, sha256};
use num_bigint::BigUint;
use tokio_util::sync::CancellationToken;

/// Lowest allowed difficulty (target bit count)
pub const MIN_DIFFICULTY: u32 = 1;
/// Highest allowed difficulty
pub const MAX_DIFFICULTY: u32 = 255;
/// Difficulty of the genesis block and of early chains
pub const INITIAL_DIFFICULTY: u32 = 12;

/// Full target for a difficulty: 2^(256 - difficulty).
/// Difficulty is a bit count, not a compact exponent encoding.
pub fn target(difficulty: u32) -> BigUint {
    let difficulty = difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
    BigUint::from(1u8) << (256 - difficulty as usize)
}

/// Decode a Bitcoin-style compact-bits value into a full target.
/// Interop utility only; consensus works on bit counts.
pub fn compact_to_target(bits: u32) -> BigUint {
    let exponent = (bits >> 24) as usize;
    let mantissa = BigUint::from(bits & 0x007f_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Encode a full target as a compact-bits value.
pub fn target_to_compact(target: &BigUint) -> u32 {
    let bytes = target.to_bytes_be();
    if *target == BigUint::from(0u8) {
        return 0;
    }

    let mut size = bytes.len();
    let mut compact: u32 = if size <= 3 {
        let mut value: u32 = 0;
        for byte in &bytes {
            value = (value << 8) | *byte as u32;
        }
        value << (8 * (3 - size))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };

    // The mantissa sign bit must stay clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Work contributed by one block: floor(2^258 / (2^difficulty + 1)).
pub fn block_work(difficulty: u32) -> BigUint {
    let numerator = BigUint::from(1u8) << 258usize;
    let denominator = (BigUint::from(1u8) << difficulty as usize) + BigUint::from(1u8);
    numerator / denominator
}

/// The hashed input for a given nonce: merkle root, previous hash, nonce,
/// difficulty, height, timestamp, and transaction count.
pub fn work_input(block: &Block, nonce: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(96);
    input.extend_from_slice(block.merkle_root.as_bytes());
    input.extend_from_slice(block.prev_hash.as_bytes());
    input.extend_from_slice(&nonce.to_be_bytes());
    input.extend_from_slice(&block.difficulty.to_be_bytes());
    input.extend_from_slice(&block.height.to_be_bytes());
    input.extend_from_slice(&block.timestamp.to_be_bytes());
    input.extend_from_slice(&block.tx_count.to_be_bytes());
    input
}

/// Hash of the work input for a given nonce
pub fn pow_hash(block: &Block, nonce: u64) -> Hash256 {
    sha256(&work_input(block, nonce))
}

fn meets_target(hash: &Hash256, target: &BigUint) -> bool {
    BigUint::from_bytes_be(hash.as_bytes()) < *target
}

/// Brute-force the nonce space from 0, filling in `nonce` and `hash` on
/// success. Checks the cancellation token every step and returns `false`
/// without touching the block when cancelled.
pub fn mine(block: &mut Block, cancel: &CancellationToken) -> bool {
    let target = target(block.difficulty);
    let mut attempts = 0u64;

    for nonce in 0..=u64::MAX {
        if cancel.is_cancelled() {
            log::debug!(
                "hash search cancelled after {} attempts at height {}",
                attempts,
                block.height
            );
            return false;
        }

        let hash = pow_hash(block, nonce);
        attempts += 1;
        if meets_target(&hash, &target) {
            block.nonce = nonce;
            block.hash = hash;
            return true;
        }

        if attempts % 100_000 == 0 {
            log::debug!("mining height {}: {} attempts", block.height, attempts);
        }
    }

    false
}

/// Validate a block's proof of work. Recomputes the hash from the stored
/// nonce and the target from the stored difficulty; the stored hash is
/// checked, never trusted.
pub fn validate(block: &Block) -> bool {
    let recomputed = pow_hash(block, block.nonce);
    recomputed == block.hash && meets_target(&recomputed, &target(block.difficulty))
}
