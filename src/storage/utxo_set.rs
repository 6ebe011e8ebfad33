// Unspent transaction output index
//
// One record per transaction id under "UTXO-<tx-id>", holding the list of
// outputs of that transaction not yet spent. Derived entirely from the
// chain; rebuildable at any time with `compute`.

use crate::core::serialize::{read_u32, write_u32};
use crate::core::{Block, Hash256, TxOutput};
use crate::error::{CodecError, StoreError};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

/// Storage prefix scoping every record of the set
pub const UTXO_PREFIX: &[u8] = b"UTXO-";

fn utxo_key(txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + 32);
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(txid.as_bytes());
    key
}

fn txid_of_key(key: &[u8]) -> Result<Hash256, CodecError> {
    Hash256::from_slice(&key[UTXO_PREFIX.len()..])
}

fn encode_outputs(outputs: &[(u32, TxOutput)]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_u32(&mut buf, outputs.len() as u32).unwrap();
    for (index, output) in outputs {
        write_u32(&mut buf, *index).unwrap();
        output.write_to(&mut buf).unwrap();
    }
    buf
}

fn decode_outputs(data: &[u8]) -> Result<Vec<(u32, TxOutput)>, CodecError> {
    let mut cursor = Cursor::new(data);
    let count = read_u32(&mut cursor)? as usize;
    let mut outputs = Vec::with_capacity(count);
    for _ in 0..count {
        let index = read_u32(&mut cursor)?;
        outputs.push((index, TxOutput::read_from(&mut cursor)?));
    }
    Ok(outputs)
}

/// UTXO set
#[derive(Clone)]
pub struct UtxoSet {
    db: sled::Db,
}

impl UtxoSet {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open an in-memory set (for testing)
    pub fn memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::new(db))
    }

    /// Unspent outputs of one transaction, if any remain
    pub fn outputs_of(&self, txid: &Hash256) -> Result<Option<Vec<(u32, TxOutput)>>, StoreError> {
        match self.db.get(utxo_key(txid))? {
            Some(data) => Ok(Some(decode_outputs(&data)?)),
            None => Ok(None),
        }
    }

    /// Rebuild the whole set from a tip-to-genesis block walk, then
    /// atomically replace the stored records.
    pub fn compute<I>(&self, blocks: I) -> Result<(), StoreError>
    where
        I: Iterator<Item = Result<Block, StoreError>>,
    {
        let mut unspent: HashMap<Hash256, Vec<(u32, TxOutput)>> = HashMap::new();
        let mut spent: HashMap<Hash256, HashSet<u32>> = HashMap::new();

        for block in blocks {
            let block = block?;
            // Newest transactions first, so in-block spends are marked
            // before the outputs they consume are visited
            for tx in block.transactions.iter().rev() {
                let spent_here = spent.get(&tx.id);
                let outputs: Vec<(u32, TxOutput)> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(index, output)| (index as u32, output.clone()))
                    .filter(|(index, _)| !spent_here.is_some_and(|s| s.contains(index)))
                    .collect();
                if !outputs.is_empty() {
                    unspent.insert(tx.id, outputs);
                }

                if !tx.is_reward() {
                    for input in &tx.inputs {
                        if let Ok(vout) = u32::try_from(input.vout) {
                            spent.entry(input.prev_txid).or_default().insert(vout);
                        }
                    }
                }
            }
        }

        let mut batch = sled::Batch::default();
        for entry in self.db.scan_prefix(UTXO_PREFIX) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        for (txid, outputs) in &unspent {
            batch.insert(utxo_key(txid), encode_outputs(outputs));
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Apply one newly connected block incrementally. Safe to call twice
    /// with the same block: spent indices are already gone and the
    /// re-inserted records are identical.
    pub fn update(&self, block: &Block) -> Result<(), StoreError> {
        for tx in &block.transactions {
            if !tx.is_reward() {
                for input in &tx.inputs {
                    let Ok(vout) = u32::try_from(input.vout) else {
                        continue;
                    };
                    let Some(outputs) = self.outputs_of(&input.prev_txid)? else {
                        continue;
                    };
                    let remaining: Vec<(u32, TxOutput)> = outputs
                        .into_iter()
                        .filter(|(index, _)| *index != vout)
                        .collect();
                    if remaining.is_empty() {
                        self.db.remove(utxo_key(&input.prev_txid))?;
                    } else {
                        self.db
                            .insert(utxo_key(&input.prev_txid), encode_outputs(&remaining))?;
                    }
                }
            }

            let fresh: Vec<(u32, TxOutput)> = tx
                .outputs
                .iter()
                .enumerate()
                .map(|(index, output)| (index as u32, output.clone()))
                .collect();
            self.db.insert(utxo_key(&tx.id), encode_outputs(&fresh))?;
        }
        Ok(())
    }

    /// Greedily gather outputs locked to `pub_key_hash` until `amount` is
    /// covered or the set is exhausted. Accumulation follows scan order,
    /// so the selection is not guaranteed minimal.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<(Hash256, u32)>), StoreError> {
        let mut accumulated = 0u64;
        let mut selected = Vec::new();

        for entry in self.db.scan_prefix(UTXO_PREFIX) {
            let (key, value) = entry?;
            let txid = txid_of_key(&key)?;
            for (index, output) in decode_outputs(&value)? {
                if output.is_locked_with(pub_key_hash) {
                    accumulated += output.value;
                    selected.push((txid, index));
                    if accumulated >= amount {
                        return Ok((accumulated, selected));
                    }
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// Total value locked to a public key hash
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, StoreError> {
        let mut balance = 0u64;
        for entry in self.db.scan_prefix(UTXO_PREFIX) {
            let (_, value) = entry?;
            for (_, output) in decode_outputs(&value)? {
                if output.is_locked_with(pub_key_hash) {
                    balance += output.value;
                }
            }
        }
        Ok(balance)
    }

    /// The full set, one entry per transaction with unspent outputs
    pub fn snapshot(&self) -> Result<Vec<(Hash256, Vec<(u32, TxOutput)>)>, StoreError> {
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(UTXO_PREFIX) {
            let (key, value) = entry?;
            records.push((txid_of_key(&key)?, decode_outputs(&value)?));
        }
        Ok(records)
    }

    /// Number of transactions with unspent outputs
    pub fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.db.scan_prefix(UTXO_PREFIX) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
