// Difficulty retargeting

use crate::consensus::pow::{MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::core::{Block, Hash256};
use crate::error::StoreError;

/// Difficulty is recomputed every this many blocks
pub const ADJUSTMENT_INTERVAL: u64 = 10;
/// Desired spacing between blocks, in seconds
pub const TARGET_BLOCK_TIME: u64 = 600;
/// An inter-block gap above this marks the chain stale and skips the
/// ratio rule
pub const STALE_GAP: u64 = 3600;
/// How many ancestors the retarget window may span
const ADJUSTMENT_WINDOW: usize = 10;

/// Difficulty for the block that will follow `parent`.
///
/// Outside the adjustment boundary the parent's difficulty is inherited.
/// On the boundary, the mean inter-block time over the trailing window is
/// compared to the target spacing: twice too fast raises the difficulty
/// by ceil(x1.2), twice too slow lowers it by floor(x0.8). A window with
/// non-increasing timestamps or a stale gap clamps to the parent's value
/// instead. The result always lands in [MIN_DIFFICULTY, MAX_DIFFICULTY].
pub fn adjust_difficulty<F>(parent: &Block, fetch: F) -> Result<u32, StoreError>
where
    F: Fn(&Hash256) -> Result<Option<Block>, StoreError>,
{
    let next_height = parent.height + 1;
    if next_height % ADJUSTMENT_INTERVAL != 0 {
        return Ok(parent.difficulty);
    }

    // Trailing window, newest first: the parent and up to nine ancestors
    let mut window = vec![parent.clone()];
    let mut cursor = parent.prev_hash;
    while window.len() < ADJUSTMENT_WINDOW && !cursor.is_zero() {
        match fetch(&cursor)? {
            Some(block) => {
                cursor = block.prev_hash;
                window.push(block);
            }
            None => break,
        }
    }

    if window.len() < 2 {
        return Ok(parent.difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY));
    }

    window.reverse();

    let mut total_gap = 0u64;
    for pair in window.windows(2) {
        let (older, newer) = (&pair[0], &pair[1]);
        if newer.timestamp <= older.timestamp {
            return Ok(parent.difficulty.max(MIN_DIFFICULTY));
        }
        let gap = newer.timestamp - older.timestamp;
        if gap > STALE_GAP {
            return Ok(parent.difficulty.max(MIN_DIFFICULTY));
        }
        total_gap += gap;
    }

    let gap_count = (window.len() - 1) as u64;
    let expected = TARGET_BLOCK_TIME * gap_count;

    // mean/target < 0.5 and > 2, in integer arithmetic
    let next = if total_gap * 2 < expected {
        (parent.difficulty * 6).div_ceil(5)
    } else if total_gap > expected * 2 {
        parent.difficulty * 4 / 5
    } else {
        parent.difficulty
    };

    Ok(next.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use std::collections::HashMap;

    // A linear chain of headers with the given timestamps; transactions
    // and proof of work are irrelevant to retargeting.
    fn chain(timestamps: &[u64], difficulty: u32) -> (Vec<Block>, HashMap<Hash256, Block>) {
        let mut blocks = Vec::new();
        let mut by_hash = HashMap::new();
        let mut prev_hash = Hash256::zero();

        for (i, &timestamp) in timestamps.iter().enumerate() {
            let mut hash_bytes = [0u8; 32];
            hash_bytes[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            let block = Block {
                timestamp,
                hash: Hash256::new(hash_bytes),
                prev_hash,
                transactions: Vec::new(),
                nonce: 0,
                height: i as u64 + 1,
                merkle_root: Hash256::zero(),
                difficulty,
                tx_count: 0,
                chain_work: BigUint::from(0u8),
            };
            prev_hash = block.hash;
            by_hash.insert(block.hash, block.clone());
            blocks.push(block);
        }
        (blocks, by_hash)
    }

    fn fetch_from(
        map: &HashMap<Hash256, Block>,
    ) -> impl Fn(&Hash256) -> Result<Option<Block>, StoreError> + '_ {
        move |hash| Ok(map.get(hash).cloned())
    }

    fn evenly_spaced(count: usize, gap: u64) -> Vec<u64> {
        (0..count).map(|i| 1_700_000_000 + i as u64 * gap).collect()
    }

    #[test]
    fn test_inherits_off_boundary() {
        // Parent heights 1..=8 all produce next heights below 10
        let (blocks, map) = chain(&evenly_spaced(8, 60), 12);
        for parent in &blocks {
            assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 12);
        }
    }

    #[test]
    fn test_fast_window_raises() {
        // Nine blocks, 60s apart: mean is far below half the target
        let (blocks, map) = chain(&evenly_spaced(9, 60), 12);
        let parent = blocks.last().unwrap();
        assert_eq!(parent.height, 9);
        // ceil(12 * 1.2) = 15
        assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 15);
    }

    #[test]
    fn test_slow_window_lowers() {
        // 1500s gaps: more than twice the 600s target
        let (blocks, map) = chain(&evenly_spaced(9, 1500), 12);
        let parent = blocks.last().unwrap();
        // floor(12 * 0.8) = 9
        assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 9);
    }

    #[test]
    fn test_on_pace_window_unchanged() {
        let (blocks, map) = chain(&evenly_spaced(9, 600), 12);
        let parent = blocks.last().unwrap();
        assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 12);
    }

    #[test]
    fn test_stale_gap_clamps() {
        let mut timestamps = evenly_spaced(9, 60);
        // One gap beyond the stale threshold
        for t in timestamps.iter_mut().skip(5) {
            *t += 4000;
        }
        let (blocks, map) = chain(&timestamps, 12);
        let parent = blocks.last().unwrap();
        assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 12);
    }

    #[test]
    fn test_non_increasing_timestamps_clamp() {
        let mut timestamps = evenly_spaced(9, 60);
        timestamps[4] = timestamps[3];
        let (blocks, map) = chain(&timestamps, 12);
        let parent = blocks.last().unwrap();
        assert_eq!(adjust_difficulty(parent, fetch_from(&map)).unwrap(), 12);
    }

    #[test]
    fn test_result_is_clamped() {
        // Fast window near the ceiling stays at the ceiling
        let (blocks, map) = chain(&evenly_spaced(9, 60), MAX_DIFFICULTY);
        let parent = blocks.last().unwrap();
        assert_eq!(
            adjust_difficulty(parent, fetch_from(&map)).unwrap(),
            MAX_DIFFICULTY
        );

        // Slow window near the floor stays at the floor
        let (blocks, map) = chain(&evenly_spaced(9, 1500), MIN_DIFFICULTY);
        let parent = blocks.last().unwrap();
        assert_eq!(
            adjust_difficulty(parent, fetch_from(&map)).unwrap(),
            MIN_DIFFICULTY
        );
    }

    #[test]
    fn test_deterministic() {
        let (blocks, map) = chain(&evenly_spaced(9, 60), 12);
        let parent = blocks.last().unwrap();
        let first = adjust_difficulty(parent, fetch_from(&map)).unwrap();
        let second = adjust_difficulty(parent, fetch_from(&map)).unwrap();
        assert_eq!(first, second);
    }
}
