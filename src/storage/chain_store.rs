// Block storage over sled
//
// Key layout:
//   "lh"                  -> tip block hash
//   "checkpoint-<height>" -> block hash at that height
//   <block-hash bytes>    -> serialized block

use crate::core::{Block, Hash256, Serializable};
use crate::error::StoreError;
use sled::transaction::ConflictableTransactionError;

/// Key of the tip pointer
pub const TIP_KEY: &[u8] = b"lh";

/// A checkpoint is recorded every this many blocks
pub const CHECKPOINT_INTERVAL: u64 = 10;

fn checkpoint_key(height: u64) -> Vec<u8> {
    format!("checkpoint-{}", height).into_bytes()
}

fn decode_hash(data: &[u8]) -> Result<Hash256, StoreError> {
    Ok(Hash256::from_slice(data)?)
}

/// Block store
#[derive(Clone)]
pub struct ChainStore {
    db: sled::Db,
}

impl ChainStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open an in-memory store (for testing)
    pub fn memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::new(db))
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        match self.db.get(hash.as_bytes())? {
            Some(data) => Ok(Some(Block::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Check if a block exists
    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(hash.as_bytes())?)
    }

    /// Store a block without touching the tip (side-chain blocks)
    pub fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        self.db
            .insert(block.hash.as_bytes(), block.serialize())?;
        Ok(())
    }

    /// Current tip hash
    pub fn tip_hash(&self) -> Result<Option<Hash256>, StoreError> {
        match self.db.get(TIP_KEY)? {
            Some(data) => Ok(Some(decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// Recorded checkpoint hash at a height, if any
    pub fn checkpoint(&self, height: u64) -> Result<Option<Hash256>, StoreError> {
        match self.db.get(checkpoint_key(height))? {
            Some(data) => Ok(Some(decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// Commit a block as the new tip. The block record, the tip pointer,
    /// and the checkpoint record (when the height is on the interval) are
    /// written in a single storage transaction.
    pub fn commit_block(&self, block: &Block) -> Result<(), StoreError> {
        self.commit_branch(std::slice::from_ref(block), &block.hash)
    }

    /// Commit a connected run of blocks (oldest first) and move the tip
    /// to `tip`, atomically. Used both for plain appends and for
    /// switching to a reorganized branch.
    pub fn commit_branch(&self, blocks: &[Block], tip: &Hash256) -> Result<(), StoreError> {
        self.db
            .transaction(|tx| {
                for block in blocks {
                    tx.insert(block.hash.as_bytes().to_vec(), block.serialize())?;
                    if block.height % CHECKPOINT_INTERVAL == 0 {
                        tx.insert(checkpoint_key(block.height), block.hash.as_bytes().to_vec())?;
                    }
                }
                tx.insert(TIP_KEY.to_vec(), tip.as_bytes().to_vec())?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
