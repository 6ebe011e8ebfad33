// Transaction staging
//
// Two disjoint id-to-transaction maps: `pending` holds received
// transactions, `queued` holds the ones claimed by an in-progress mining
// attempt. A transaction lives in at most one map at a time.

use crate::core::{Hash256, Transaction};
use std::collections::HashMap;
use std::sync::Mutex;

/// Which staging map a transaction sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBucket {
    Pending,
    Queued,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<Hash256, Transaction>,
    queued: HashMap<Hash256, Transaction>,
}

/// Mempool
#[derive(Default)]
pub struct Mempool {
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transaction into `pending`. Returns false if it is
    /// already staged in either map.
    pub fn add(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.contains_key(&tx.id) || inner.queued.contains_key(&tx.id) {
            return false;
        }
        inner.pending.insert(tx.id, tx);
        true
    }

    /// Check whether a transaction is staged in either map
    pub fn contains(&self, id: &Hash256) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pending.contains_key(id) || inner.queued.contains_key(id)
    }

    /// Fetch a staged transaction from either map
    pub fn get(&self, id: &Hash256) -> Option<Transaction> {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .get(id)
            .or_else(|| inner.queued.get(id))
            .cloned()
    }

    /// Move a transaction into the target map, removing it from the
    /// other one first. Idempotent.
    pub fn move_to(&self, tx: Transaction, target: PoolBucket) {
        let mut inner = self.inner.lock().unwrap();
        match target {
            PoolBucket::Pending => {
                inner.queued.remove(&tx.id);
                inner.pending.insert(tx.id, tx);
            }
            PoolBucket::Queued => {
                inner.pending.remove(&tx.id);
                inner.queued.insert(tx.id, tx);
            }
        }
    }

    /// Purge a transaction id from both maps (used once it is mined)
    pub fn remove_from_all(&self, id: &Hash256) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(id);
        inner.queued.remove(id);
    }

    /// Empty both maps (used after a block this node mined is accepted)
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        inner.queued.clear();
    }

    /// Claim up to `max` pending transactions for a mining attempt,
    /// moving them to `queued`.
    pub fn claim_pending(&self, max: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<Hash256> = inner.pending.keys().take(max).copied().collect();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = inner.pending.remove(&id) {
                inner.queued.insert(id, tx.clone());
                claimed.push(tx);
            }
        }
        claimed
    }

    /// Copy up to `max` pending transactions without claiming them
    /// (pool pull responses).
    pub fn pending_sample(&self, max: usize) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        inner.pending.values().take(max).cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }
}
