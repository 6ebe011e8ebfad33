// Consensus rules: proof of work and difficulty retargeting

pub mod difficulty;
pub mod pow;

pub use difficulty::{ADJUSTMENT_INTERVAL, STALE_GAP, TARGET_BLOCK_TIME, adjust_difficulty};
pub use pow::{INITIAL_DIFFICULTY, MAX_DIFFICULTY, MIN_DIFFICULTY, block_work};
