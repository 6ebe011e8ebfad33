// Ledger state machine and transaction staging

pub mod blockchain;
pub mod mempool;

pub use blockchain::{
    ApplyOutcome, Blockchain, ChainIter, MAX_FORK_LENGTH, MAX_TIMESTAMP_DRIFT, TipAnnounce,
    TipInfo,
};
pub use mempool::{Mempool, PoolBucket};
