// Merkle commitment over a block's transactions

use crate::core::{Hash256, Serializable, Transaction, sha256};
use crate::error::ValidationError;

/// Compute the merkle root of an ordered transaction list.
///
/// Leaves are SHA256 of each transaction's serialized bytes; internal
/// nodes hash the concatenation of their two children. A level with an
/// odd node count duplicates its last node. An empty list is an error.
pub fn merkle_root(transactions: &[Transaction]) -> Result<Hash256, ValidationError> {
    if transactions.is_empty() {
        return Err(ValidationError::EmptyBlock);
    }

    let mut level: Vec<Hash256> = transactions
        .iter()
        .map(|tx| sha256(&tx.serialize()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };

            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(left.as_bytes());
            combined.extend_from_slice(right.as_bytes());
            next.push(sha256(&combined));
        }
        level = next;
    }

    Ok(level[0])
}
