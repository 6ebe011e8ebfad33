// Block data structure

use crate::core::serialize::{
    read_biguint, read_hash, read_u32, read_u64, write_biguint, write_hash, write_u32, write_u64,
};
use crate::core::{Hash256, Serializable, Transaction};
use crate::error::CodecError;
use num_bigint::BigUint;
use std::io::Cursor;

/// Height of the genesis block. Heights start at 1, not 0.
pub const GENESIS_HEIGHT: u64 = 1;

/// Block
///
/// Immutable once accepted into the ledger; a reorganization removes and
/// re-adds blocks, it never mutates one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Creation time (Unix seconds)
    pub timestamp: u64,
    /// Proof-of-work hash over the work input for `nonce`
    pub hash: Hash256,
    /// Hash of the parent block (zero for genesis)
    pub prev_hash: Hash256,
    /// Ordered transaction list; first entry is the coinbase
    pub transactions: Vec<Transaction>,
    /// Nonce satisfying the proof-of-work target
    pub nonce: u64,
    /// Chain position; genesis is height 1
    pub height: u64,
    /// Merkle commitment over `transactions`
    pub merkle_root: Hash256,
    /// Difficulty as a target bit count (target = 2^(256 - difficulty))
    pub difficulty: u32,
    /// Number of transactions, part of the work input
    pub tx_count: u32,
    /// Cumulative chain work accumulated from the parent
    pub chain_work: BigUint,
}

impl Block {
    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero() && self.height == GENESIS_HEIGHT
    }

    /// Ids of every transaction in the block
    pub fn tx_ids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.id).collect()
    }

    /// Find a transaction by id
    pub fn find_tx(&self, id: &Hash256) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id == *id)
    }
}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_u64(&mut buf, self.timestamp).unwrap();
        write_hash(&mut buf, &self.hash).unwrap();
        write_hash(&mut buf, &self.prev_hash).unwrap();
        write_u64(&mut buf, self.nonce).unwrap();
        write_u64(&mut buf, self.height).unwrap();
        write_hash(&mut buf, &self.merkle_root).unwrap();
        write_u32(&mut buf, self.difficulty).unwrap();
        write_biguint(&mut buf, &self.chain_work).unwrap();
        write_u32(&mut buf, self.transactions.len() as u32).unwrap();
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);

        let timestamp = read_u64(&mut cursor)?;
        let hash = read_hash(&mut cursor)?;
        let prev_hash = read_hash(&mut cursor)?;
        let nonce = read_u64(&mut cursor)?;
        let height = read_u64(&mut cursor)?;
        let merkle_root = read_hash(&mut cursor)?;
        let difficulty = read_u32(&mut cursor)?;
        let chain_work = read_biguint(&mut cursor)?;

        let tx_count = read_u32(&mut cursor)?;
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::read_from(&mut cursor)?);
        }

        Ok(Self {
            timestamp,
            hash,
            prev_hash,
            transactions,
            nonce,
            height,
            merkle_root,
            difficulty,
            tx_count,
            chain_work,
        })
    }
}
