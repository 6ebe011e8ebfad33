// Error taxonomy for the node

use crate::core::Hash256;
use thiserror::Error;

/// Failure while encoding or decoding a binary record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Consensus rule violations. Rejected locally, logged, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block has no transactions")]
    EmptyBlock,
    #[error("block height {got} does not follow parent height {parent}")]
    BadHeight { parent: u64, got: u64 },
    #[error("difficulty {got} does not match expected {expected}")]
    WrongDifficulty { expected: u32, got: u32 },
    #[error("timestamp outside the accepted window")]
    BadTimestamp,
    #[error("previous hash does not match parent")]
    PrevHashMismatch,
    #[error("merkle root does not match transactions")]
    MerkleMismatch,
    #[error("proof of work does not meet target")]
    BadProofOfWork,
    #[error("chain work does not accumulate from parent")]
    BadChainWork,
    #[error("checkpoint mismatch at height {0}")]
    CheckpointMismatch(u64),
    #[error("block references unknown parent {0}")]
    OrphanBlock(Hash256),
    #[error("input references unknown transaction {0}")]
    UnknownInput(Hash256),
    #[error("input references output index {vout} of {txid}, which does not exist")]
    BadOutputIndex { txid: Hash256, vout: i32 },
    #[error("inputs worth {available} cannot cover outputs worth {spent}")]
    InsufficientFunds { available: u64, spent: u64 },
    #[error("signature verification failed")]
    BadSignature,
    #[error("malformed address")]
    BadAddress,
    #[error("not a valid genesis block")]
    BadGenesis,
}

/// Storage layer failures. Fatal at bootstrap, operation-local afterwards.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] CodecError),
    #[error("missing block {0}")]
    MissingBlock(Hash256),
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => StoreError::Db(e),
        }
    }
}

/// Wire protocol failures. The offending message is logged and dropped.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame shorter than the fixed header")]
    ShortFrame,
    #[error("command tag is not ASCII")]
    BadCommandTag,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("payload decode failed: {0}")]
    Decode(#[from] CodecError),
    #[error("payload of {0} bytes exceeds the frame limit")]
    OversizedPayload(usize),
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("peer {0} is not connected")]
    UnknownPeer(String),
}

/// Fork resolution failures. No partial reorg is ever committed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForkError {
    #[error("no common ancestor found within {0} blocks")]
    NoCommonAncestor(u64),
}

/// Top-level error for node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Network(#[from] NetError),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error("internal error: {0}")]
    Internal(String),
}
