// Ledger state machine
//
// Owns the append/validate/reorganize pipeline. Every mutation of tip
// state goes through the single lock in `state`, so concurrent block
// arrivals can never interleave partial updates.

use crate::consensus::pow;
use crate::consensus::{adjust_difficulty, block_work};
use crate::core::block::GENESIS_HEIGHT;
use crate::core::{
    BLOCK_REWARD, Block, GENESIS_REWARD, Hash256, Transaction, merkle_root,
};
use crate::crypto::{Address, verify_inputs};
use crate::error::{ForkError, NodeError, StoreError, ValidationError};
use crate::storage::{CHECKPOINT_INTERVAL, ChainStore};
use num_bigint::BigUint;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Deepest fork the node resolves automatically
pub const MAX_FORK_LENGTH: u64 = 6;

/// How far into the future a block timestamp may run
pub const MAX_TIMESTAMP_DRIFT: u64 = 7200;

/// Current tip of the active chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    pub height: u64,
    pub hash: Hash256,
    pub work: BigUint,
}

/// Announcement sent on every tip move
#[derive(Debug, Clone)]
pub struct TipAnnounce {
    pub height: u64,
    pub hash: Hash256,
}

/// What applying a block did to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Appended to the current tip
    Extended,
    /// Greater-work branch adopted; carries the abandoned transactions
    /// that are not part of the new branch
    Reorganized { returned: Vec<Transaction> },
    /// Stored as a non-active side block
    SideChain,
    /// The block was already in the store
    AlreadyKnown,
}

/// Hook invoked with transactions returned to the pool by a reorg
pub type ReturnedTxHook = Box<dyn Fn(Vec<Transaction>) + Send + Sync>;

pub struct Blockchain {
    store: ChainStore,
    state: Mutex<Option<TipInfo>>,
    announce: broadcast::Sender<TipAnnounce>,
    returned_hook: RwLock<Option<ReturnedTxHook>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Blockchain {
    /// Open the ledger, restoring the tip from storage if present.
    pub fn open(store: ChainStore) -> Result<Self, StoreError> {
        let state = match store.tip_hash()? {
            Some(hash) => {
                let tip = store
                    .get_block(&hash)?
                    .ok_or(StoreError::MissingBlock(hash))?;
                Some(TipInfo {
                    height: tip.height,
                    hash: tip.hash,
                    work: tip.chain_work,
                })
            }
            None => None,
        };
        let (announce, _) = broadcast::channel(256);
        Ok(Self {
            store,
            state: Mutex::new(state),
            announce,
            returned_hook: RwLock::new(None),
        })
    }

    /// Register the transactions-returned-to-pool callback, invoked on
    /// every reorganization with the abandoned-branch transactions.
    pub fn set_returned_hook(&self, hook: ReturnedTxHook) {
        *self.returned_hook.write().unwrap() = Some(hook);
    }

    /// Subscribe to tip announcements
    pub fn subscribe(&self) -> broadcast::Receiver<TipAnnounce> {
        self.announce.subscribe()
    }

    /// Current tip, if the chain is initialized
    pub fn tip(&self) -> Option<TipInfo> {
        self.state.lock().unwrap().clone()
    }

    /// Height of the active chain; 0 before genesis
    pub fn best_height(&self) -> u64 {
        self.tip().map(|t| t.height).unwrap_or(0)
    }

    /// Mine and commit the genesis block paying `GENESIS_REWARD` to the
    /// given address. Fails if the chain is already initialized.
    pub fn create_genesis(&self, reward_to: &Address, timestamp: u64) -> Result<Block, NodeError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(NodeError::Internal("chain is already initialized".into()));
        }

        let pub_key_hash = reward_to.to_pubkey_hash()?;
        let coinbase = Transaction::reward(
            &pub_key_hash,
            GENESIS_REWARD,
            GENESIS_HEIGHT,
            b"genesis".to_vec(),
        );
        let difficulty = pow::INITIAL_DIFFICULTY;
        let mut block = Block {
            timestamp,
            hash: Hash256::zero(),
            prev_hash: Hash256::zero(),
            merkle_root: merkle_root(std::slice::from_ref(&coinbase))?,
            transactions: vec![coinbase],
            nonce: 0,
            height: GENESIS_HEIGHT,
            difficulty,
            tx_count: 1,
            chain_work: block_work(difficulty),
        };
        pow::mine(&mut block, &CancellationToken::new());

        self.store.commit_block(&block)?;
        *state = Some(TipInfo {
            height: block.height,
            hash: block.hash,
            work: block.chain_work.clone(),
        });
        let _ = self.announce.send(TipAnnounce {
            height: block.height,
            hash: block.hash,
        });
        log::info!("genesis block {} created", block.hash);
        Ok(block)
    }

    /// Assemble an unmined candidate extending the current tip.
    pub fn build_candidate(
        &self,
        transactions: Vec<Transaction>,
        reward_pub_key_hash: &[u8],
        timestamp: u64,
        entropy: Vec<u8>,
    ) -> Result<Block, NodeError> {
        let tip = self
            .tip()
            .ok_or_else(|| NodeError::Internal("chain is not initialized".into()))?;
        let parent = self
            .store
            .get_block(&tip.hash)?
            .ok_or(StoreError::MissingBlock(tip.hash))?;
        self.candidate_on(&parent, transactions, reward_pub_key_hash, timestamp, entropy)
    }

    /// Assemble an unmined candidate extending an arbitrary parent.
    pub fn candidate_on(
        &self,
        parent: &Block,
        transactions: Vec<Transaction>,
        reward_pub_key_hash: &[u8],
        timestamp: u64,
        entropy: Vec<u8>,
    ) -> Result<Block, NodeError> {
        let height = parent.height + 1;
        let difficulty = adjust_difficulty(parent, |h| self.store.get_block(h))?;
        let coinbase = Transaction::reward(reward_pub_key_hash, BLOCK_REWARD, height, entropy);

        let mut txs = Vec::with_capacity(transactions.len() + 1);
        txs.push(coinbase);
        txs.extend(transactions);

        Ok(Block {
            timestamp,
            hash: Hash256::zero(),
            prev_hash: parent.hash,
            merkle_root: merkle_root(&txs)?,
            nonce: 0,
            height,
            difficulty,
            tx_count: txs.len() as u32,
            chain_work: parent.chain_work.clone() + block_work(difficulty),
            transactions: txs,
        })
    }

    /// Apply a block: extend the tip, adopt a greater-work branch, or
    /// persist a side block. The whole application runs under the
    /// exclusive tip lock.
    pub fn add_block(&self, block: &Block) -> Result<ApplyOutcome, NodeError> {
        let mut state = self.state.lock().unwrap();

        if self.store.has_block(&block.hash)? {
            return Ok(ApplyOutcome::AlreadyKnown);
        }

        let Some(tip) = state.clone() else {
            // Only a genesis block can initialize an empty chain
            self.validate_genesis(block)?;
            self.store.commit_block(block)?;
            *state = Some(TipInfo {
                height: block.height,
                hash: block.hash,
                work: block.chain_work.clone(),
            });
            let _ = self.announce.send(TipAnnounce {
                height: block.height,
                hash: block.hash,
            });
            return Ok(ApplyOutcome::Extended);
        };

        let parent = self
            .store
            .get_block(&block.prev_hash)?
            .ok_or(ValidationError::OrphanBlock(block.prev_hash))?;
        self.is_block_valid(block, &parent)?;

        if block.prev_hash == tip.hash {
            self.store.commit_block(block)?;
            *state = Some(TipInfo {
                height: block.height,
                hash: block.hash,
                work: block.chain_work.clone(),
            });
            let _ = self.announce.send(TipAnnounce {
                height: block.height,
                hash: block.hash,
            });
            return Ok(ApplyOutcome::Extended);
        }

        if block.chain_work > tip.work {
            let returned = self.reorganize(&tip, block)?;
            *state = Some(TipInfo {
                height: block.height,
                hash: block.hash,
                work: block.chain_work.clone(),
            });
            let _ = self.announce.send(TipAnnounce {
                height: block.height,
                hash: block.hash,
            });
            if let Some(hook) = self.returned_hook.read().unwrap().as_ref() {
                hook(returned.clone());
            }
            return Ok(ApplyOutcome::Reorganized { returned });
        }

        self.store.put_block(block)?;
        log::debug!(
            "stored side block {} at height {} (tip work unchanged)",
            block.hash,
            block.height
        );
        Ok(ApplyOutcome::SideChain)
    }

    /// Switch to the branch ending in `candidate`. Walks both chains
    /// back at most `MAX_FORK_LENGTH` blocks looking for a common
    /// (height, hash) ancestor; fails without touching stored state if
    /// none is found. Returns the abandoned transactions that are not
    /// part of the new branch.
    fn reorganize(&self, tip: &TipInfo, candidate: &Block) -> Result<Vec<Transaction>, NodeError> {
        // Active chain tail, tip first
        let mut old_branch = Vec::new();
        let mut cursor = Some(tip.hash);
        while let Some(hash) = cursor {
            if old_branch.len() as u64 > MAX_FORK_LENGTH {
                break;
            }
            let block = self
                .store
                .get_block(&hash)?
                .ok_or(StoreError::MissingBlock(hash))?;
            cursor = if block.prev_hash.is_zero() {
                None
            } else {
                Some(block.prev_hash)
            };
            old_branch.push(block);
        }
        let old_positions: HashMap<(u64, Hash256), usize> = old_branch
            .iter()
            .enumerate()
            .map(|(i, b)| ((b.height, b.hash), i))
            .collect();

        // New branch, newest first, stopping at the common ancestor
        let mut new_branch = vec![candidate.clone()];
        let mut ancestor_index = None;
        let mut cursor = candidate.prev_hash;
        for _ in 0..=MAX_FORK_LENGTH {
            let Some(block) = self.store.get_block(&cursor)? else {
                break;
            };
            if let Some(&index) = old_positions.get(&(block.height, block.hash)) {
                ancestor_index = Some(index);
                break;
            }
            cursor = block.prev_hash;
            new_branch.push(block);
            if cursor.is_zero() {
                break;
            }
        }

        let Some(ancestor_index) = ancestor_index else {
            log::warn!(
                "rejecting branch ending in {}: no common ancestor found",
                candidate.hash
            );
            return Err(ForkError::NoCommonAncestor(MAX_FORK_LENGTH).into());
        };

        // Transactions only the abandoned branch carried go back to the
        // pool; coinbases of abandoned blocks are simply dropped.
        let new_ids: HashSet<Hash256> = new_branch
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.id))
            .collect();
        let mut returned = Vec::new();
        for block in old_branch[..ancestor_index].iter().rev() {
            for tx in &block.transactions {
                if !tx.is_reward() && !new_ids.contains(&tx.id) {
                    returned.push(tx.clone());
                }
            }
        }

        new_branch.reverse();
        self.store.commit_branch(&new_branch, &candidate.hash)?;
        log::info!(
            "reorganized to {} at height {} ({} blocks replaced, {} transactions returned)",
            candidate.hash,
            candidate.height,
            ancestor_index,
            returned.len()
        );
        Ok(returned)
    }

    /// The block validation pipeline, in order, short-circuiting on the
    /// first failure.
    fn is_block_valid(&self, block: &Block, parent: &Block) -> Result<(), NodeError> {
        // 1. Difficulty must be exactly what retargeting derives
        let expected = adjust_difficulty(parent, |h| self.store.get_block(h))?;
        if block.difficulty != expected {
            return Err(ValidationError::WrongDifficulty {
                expected,
                got: block.difficulty,
            }
            .into());
        }

        // 2. Every non-coinbase transaction must verify against the
        //    chain this block extends
        for tx in &block.transactions {
            if !tx.is_reward() {
                self.verify_transaction_at(tx, &block.prev_hash)?;
            }
        }

        // 3. Timestamp window
        if block.timestamp < parent.timestamp
            || block.timestamp > unix_now() + MAX_TIMESTAMP_DRIFT
        {
            return Err(ValidationError::BadTimestamp.into());
        }

        // 4. Checkpoint consistency along the ancestor path
        self.verify_checkpoint_path(parent)?;

        // 5. Structure, merkle commitment, and proof of work
        if block.height != parent.height + 1 {
            return Err(ValidationError::BadHeight {
                parent: parent.height,
                got: block.height,
            }
            .into());
        }
        if block.timestamp <= parent.timestamp {
            return Err(ValidationError::BadTimestamp.into());
        }
        if block.prev_hash != parent.hash {
            return Err(ValidationError::PrevHashMismatch.into());
        }
        if block.transactions.is_empty() || block.tx_count as usize != block.transactions.len() {
            return Err(ValidationError::EmptyBlock.into());
        }
        if merkle_root(&block.transactions)? != block.merkle_root {
            return Err(ValidationError::MerkleMismatch.into());
        }
        if !pow::validate(block) {
            return Err(ValidationError::BadProofOfWork.into());
        }
        if block.chain_work != parent.chain_work.clone() + block_work(block.difficulty) {
            return Err(ValidationError::BadChainWork.into());
        }
        Ok(())
    }

    fn validate_genesis(&self, block: &Block) -> Result<(), NodeError> {
        if !block.is_genesis() {
            return Err(ValidationError::BadGenesis.into());
        }
        if block.transactions.len() != 1 || !block.transactions[0].is_reward() {
            return Err(ValidationError::BadGenesis.into());
        }
        if block.tx_count != 1 {
            return Err(ValidationError::BadGenesis.into());
        }
        if merkle_root(&block.transactions)? != block.merkle_root {
            return Err(ValidationError::MerkleMismatch.into());
        }
        if !pow::validate(block) {
            return Err(ValidationError::BadProofOfWork.into());
        }
        if block.chain_work != block_work(block.difficulty) {
            return Err(ValidationError::BadChainWork.into());
        }
        Ok(())
    }

    // If the ancestor path crosses the latest checkpoint height, the
    // ancestor there must carry the recorded hash, and difficulty must
    // recompute correctly along the way down.
    fn verify_checkpoint_path(&self, parent: &Block) -> Result<(), NodeError> {
        let cp_height = parent.height - (parent.height % CHECKPOINT_INTERVAL);
        if cp_height == 0 {
            return Ok(());
        }
        let Some(expected) = self.store.checkpoint(cp_height)? else {
            return Ok(());
        };

        let mut cursor = parent.clone();
        while cursor.height > cp_height {
            let ancestor = self
                .store
                .get_block(&cursor.prev_hash)?
                .ok_or(ValidationError::OrphanBlock(cursor.prev_hash))?;
            let recomputed = adjust_difficulty(&ancestor, |h| self.store.get_block(h))?;
            if cursor.difficulty != recomputed {
                return Err(ValidationError::CheckpointMismatch(cp_height).into());
            }
            cursor = ancestor;
        }
        if cursor.hash != expected {
            return Err(ValidationError::CheckpointMismatch(cp_height).into());
        }
        Ok(())
    }

    /// Validate a free-standing transaction against the active chain
    /// (mempool admission).
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), NodeError> {
        let tip = self
            .tip()
            .ok_or_else(|| NodeError::Internal("chain is not initialized".into()))?;
        self.verify_transaction_at(tx, &tip.hash)
    }

    // A transaction is valid if it is a coinbase, or if every input
    // references a transaction in the chain history below `head`, the
    // signatures verify, and the referenced values cover the outputs.
    fn verify_transaction_at(&self, tx: &Transaction, head: &Hash256) -> Result<(), NodeError> {
        if tx.is_reward() {
            return Ok(());
        }

        let mut prev_txs: HashMap<Hash256, Transaction> = HashMap::new();
        for input in &tx.inputs {
            if prev_txs.contains_key(&input.prev_txid) {
                continue;
            }
            let prev = self
                .find_transaction_from(&input.prev_txid, head)?
                .ok_or(ValidationError::UnknownInput(input.prev_txid))?;
            prev_txs.insert(prev.id, prev);
        }

        let mut available = 0u64;
        for input in &tx.inputs {
            let prev = &prev_txs[&input.prev_txid];
            let output = usize::try_from(input.vout)
                .ok()
                .and_then(|vout| prev.outputs.get(vout))
                .ok_or(ValidationError::BadOutputIndex {
                    txid: input.prev_txid,
                    vout: input.vout,
                })?;
            available += output.value;
        }
        let spent = tx.total_output_value();
        if available < spent {
            return Err(ValidationError::InsufficientFunds { available, spent }.into());
        }

        verify_inputs(tx, &prev_txs)?;
        Ok(())
    }

    /// Find a transaction anywhere in the active chain history
    pub fn find_transaction(&self, id: &Hash256) -> Result<Option<Transaction>, StoreError> {
        match self.tip() {
            Some(tip) => self.find_transaction_from(id, &tip.hash),
            None => Ok(None),
        }
    }

    fn find_transaction_from(
        &self,
        id: &Hash256,
        head: &Hash256,
    ) -> Result<Option<Transaction>, StoreError> {
        let mut cursor = Some(*head);
        while let Some(hash) = cursor {
            let block = self
                .store
                .get_block(&hash)?
                .ok_or(StoreError::MissingBlock(hash))?;
            if let Some(tx) = block.find_tx(id) {
                return Ok(Some(tx.clone()));
            }
            cursor = if block.prev_hash.is_zero() {
                None
            } else {
                Some(block.prev_hash)
            };
        }
        Ok(None)
    }

    /// Get a block by hash
    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        self.store.get_block(hash)
    }

    /// Get the active-chain block at a height
    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        for block in self.iter() {
            let block = block?;
            if block.height == height {
                return Ok(Some(block));
            }
            if block.height < height {
                break;
            }
        }
        Ok(None)
    }

    /// Active-chain blocks with `from <= height <= to`, oldest first
    pub fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>, StoreError> {
        let mut blocks = Vec::new();
        for block in self.iter() {
            let block = block?;
            if block.height < from {
                break;
            }
            if block.height <= to {
                blocks.push(block);
            }
        }
        blocks.reverse();
        Ok(blocks)
    }

    /// Hashes of active-chain blocks above a height, oldest first
    pub fn hashes_above(&self, height: u64) -> Result<Vec<Hash256>, StoreError> {
        let mut hashes = Vec::new();
        for block in self.iter() {
            let block = block?;
            if block.height <= height {
                break;
            }
            hashes.push(block.hash);
        }
        hashes.reverse();
        Ok(hashes)
    }

    /// Check whether a block is stored (active or side chain)
    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StoreError> {
        self.store.has_block(hash)
    }

    /// Walk the active chain from the tip down to genesis
    pub fn iter(&self) -> ChainIter {
        ChainIter {
            store: self.store.clone(),
            cursor: self.tip().map(|t| t.hash),
        }
    }
}

/// Iterator over the active chain, tip to genesis
pub struct ChainIter {
    store: ChainStore,
    cursor: Option<Hash256>,
}

impl Iterator for ChainIter {
    type Item = Result<Block, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.cursor.take()?;
        match self.store.get_block(&hash) {
            Ok(Some(block)) => {
                if !block.prev_hash.is_zero() {
                    self.cursor = Some(block.prev_hash);
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(StoreError::MissingBlock(hash))),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    const T0: u64 = 1_700_000_000;

    fn new_chain() -> (Blockchain, KeyPair) {
        let chain = Blockchain::open(ChainStore::memory().unwrap()).unwrap();
        let key = KeyPair::generate();
        chain.create_genesis(&key.address, T0).unwrap();
        (chain, key)
    }

    fn mine_on(
        chain: &Blockchain,
        parent: &Block,
        txs: Vec<Transaction>,
        timestamp: u64,
        entropy: &[u8],
    ) -> Block {
        let key = KeyPair::generate();
        let mut block = chain
            .candidate_on(parent, txs, &key.pubkey_hash(), timestamp, entropy.to_vec())
            .unwrap();
        assert!(pow::mine(&mut block, &CancellationToken::new()));
        block
    }

    fn extend(chain: &Blockchain, count: u64) -> Block {
        let mut parent = chain
            .block_by_hash(&chain.tip().unwrap().hash)
            .unwrap()
            .unwrap();
        for i in 0..count {
            let block = mine_on(
                chain,
                &parent,
                Vec::new(),
                parent.timestamp + 600,
                &[i as u8],
            );
            assert_eq!(chain.add_block(&block).unwrap(), ApplyOutcome::Extended);
            parent = block;
        }
        parent
    }

    #[test]
    fn test_genesis_scenario() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(GENESIS_HEIGHT).unwrap().unwrap();

        assert!(genesis.is_genesis());
        assert!(genesis.prev_hash.is_zero());
        assert_eq!(genesis.height, 1);
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_reward());
        assert_eq!(genesis.transactions[0].outputs[0].value, GENESIS_REWARD);
        assert_eq!(
            genesis.transactions[0].outputs[0].pub_key_hash,
            key.pubkey_hash().to_vec()
        );
        assert_eq!(chain.best_height(), 1);
    }

    #[test]
    fn test_extend_and_query() {
        let (chain, _) = new_chain();
        extend(&chain, 3);

        assert_eq!(chain.best_height(), 4);
        assert!(chain.block_by_height(3).unwrap().is_some());
        assert!(chain.block_by_height(9).unwrap().is_none());

        let range = chain.blocks_in_range(2, 3).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].height, 2);
        assert_eq!(range[1].height, 3);

        let hashes = chain.hashes_above(2).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[1], chain.tip().unwrap().hash);
    }

    #[test]
    fn test_duplicate_apply_is_noop() {
        let (chain, _) = new_chain();
        let tip = extend(&chain, 1);
        assert_eq!(chain.add_block(&tip).unwrap(), ApplyOutcome::AlreadyKnown);
        assert_eq!(chain.best_height(), 2);
    }

    #[test]
    fn test_wrong_difficulty_rejected() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();

        let mut block = mine_on(&chain, &genesis, Vec::new(), T0 + 600, b"x");
        block.difficulty += 1;
        // Re-mine so only the difficulty rule can fail
        block.chain_work = genesis.chain_work.clone() + block_work(block.difficulty);
        assert!(pow::mine(&mut block, &CancellationToken::new()));

        match chain.add_block(&block) {
            Err(NodeError::Validation(ValidationError::WrongDifficulty { .. })) => {}
            other => panic!("expected WrongDifficulty, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_non_increasing_timestamp_rejected() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();

        let block = mine_on(&chain, &genesis, Vec::new(), T0, b"x");
        match chain.add_block(&block) {
            Err(NodeError::Validation(ValidationError::BadTimestamp)) => {}
            other => panic!("expected BadTimestamp, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tampered_merkle_rejected() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();

        let mut block = mine_on(&chain, &genesis, Vec::new(), T0 + 600, b"x");
        // Swap in a different coinbase without recomputing the root
        block.transactions[0] =
            Transaction::reward(&key.pubkey_hash(), BLOCK_REWARD, 2, b"other".to_vec());
        match chain.add_block(&block) {
            Err(NodeError::Validation(ValidationError::MerkleMismatch)) => {}
            other => panic!("expected MerkleMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_spend_verifies_and_applies() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();

        let recipient = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![crate::core::TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        chain.verify_transaction(&tx).unwrap();

        let block = mine_on(&chain, &genesis, vec![tx], T0 + 600, b"x");
        assert_eq!(chain.add_block(&block).unwrap(), ApplyOutcome::Extended);
    }

    #[test]
    fn test_unknown_input_rejected() {
        let (chain, key) = new_chain();

        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(
                Hash256::new([9; 32]),
                0,
                key.pubkey_bytes(),
            )],
            vec![crate::core::TxOutput::new(100, vec![1; 20])],
        );
        tx.finalize(2);

        match chain.verify_transaction(&tx) {
            Err(NodeError::Validation(ValidationError::UnknownInput(_))) => {}
            other => panic!("expected UnknownInput, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_overspend_rejected() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();

        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![crate::core::TxOutput::new(GENESIS_REWARD + 1, vec![1; 20])],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        match chain.verify_transaction(&tx) {
            Err(NodeError::Validation(ValidationError::InsufficientFunds { .. })) => {}
            other => panic!("expected InsufficientFunds, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_greater_work_branch_wins() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();

        // Active chain: two blocks on genesis
        extend(&chain, 2);
        let tip_before = chain.tip().unwrap();

        // Side branch from genesis with three blocks: more cumulative
        // work despite equal difficulty per block
        let s1 = mine_on(&chain, &genesis, Vec::new(), T0 + 300, b"s1");
        assert_eq!(chain.add_block(&s1).unwrap(), ApplyOutcome::SideChain);
        let s2 = mine_on(&chain, &s1, Vec::new(), T0 + 900, b"s2");
        assert_eq!(chain.add_block(&s2).unwrap(), ApplyOutcome::SideChain);
        let s3 = mine_on(&chain, &s2, Vec::new(), T0 + 1500, b"s3");
        match chain.add_block(&s3).unwrap() {
            ApplyOutcome::Reorganized { .. } => {}
            other => panic!("expected reorganization, got {:?}", other),
        }

        let tip_after = chain.tip().unwrap();
        assert_eq!(tip_after.hash, s3.hash);
        assert_eq!(tip_after.height, 4);
        assert!(tip_after.work > tip_before.work);
    }

    #[test]
    fn test_lesser_work_branch_stays_side() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        extend(&chain, 2);
        let tip = chain.tip().unwrap();

        let side = mine_on(&chain, &genesis, Vec::new(), T0 + 300, b"side");
        assert_eq!(chain.add_block(&side).unwrap(), ApplyOutcome::SideChain);
        assert_eq!(chain.tip().unwrap(), tip);
    }

    #[test]
    fn test_reorg_returns_abandoned_transactions() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();

        // A spend that only the active branch will contain
        let recipient = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![crate::core::TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        let a1 = mine_on(&chain, &genesis, vec![tx.clone()], T0 + 600, b"a1");
        assert_eq!(chain.add_block(&a1).unwrap(), ApplyOutcome::Extended);

        // Competing branch of two empty blocks (fork length within bound)
        let b1 = mine_on(&chain, &genesis, Vec::new(), T0 + 300, b"b1");
        assert_eq!(chain.add_block(&b1).unwrap(), ApplyOutcome::SideChain);
        let b2 = mine_on(&chain, &b1, Vec::new(), T0 + 900, b"b2");
        match chain.add_block(&b2).unwrap() {
            ApplyOutcome::Reorganized { returned } => {
                assert_eq!(returned.len(), 1);
                assert_eq!(returned[0].id, tx.id);
            }
            other => panic!("expected reorganization, got {:?}", other),
        }
    }

    #[test]
    fn test_reorg_skips_shared_transactions() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();

        let recipient = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![crate::core::TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        // Both branches carry the same transaction
        let a1 = mine_on(&chain, &genesis, vec![tx.clone()], T0 + 600, b"a1");
        assert_eq!(chain.add_block(&a1).unwrap(), ApplyOutcome::Extended);

        let b1 = mine_on(&chain, &genesis, vec![tx.clone()], T0 + 300, b"b1");
        assert_eq!(chain.add_block(&b1).unwrap(), ApplyOutcome::SideChain);
        let b2 = mine_on(&chain, &b1, Vec::new(), T0 + 900, b"b2");
        match chain.add_block(&b2).unwrap() {
            ApplyOutcome::Reorganized { returned } => assert!(returned.is_empty()),
            other => panic!("expected reorganization, got {:?}", other),
        }
    }

    #[test]
    fn test_returned_hook_fires_on_reorg() {
        let (chain, key) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();

        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        chain.set_returned_hook(Box::new(move |txs| {
            sink.lock().unwrap().extend(txs.into_iter().map(|tx| tx.id));
        }));

        let recipient = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![crate::core::TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![crate::core::TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        let a1 = mine_on(&chain, &genesis, vec![tx.clone()], T0 + 600, b"a1");
        chain.add_block(&a1).unwrap();
        let b1 = mine_on(&chain, &genesis, Vec::new(), T0 + 300, b"b1");
        chain.add_block(&b1).unwrap();
        let b2 = mine_on(&chain, &b1, Vec::new(), T0 + 900, b"b2");
        chain.add_block(&b2).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![tx.id]);
    }

    #[test]
    fn test_fork_too_deep_fails_without_mutation() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();

        // Active chain: seven blocks past genesis
        extend(&chain, 7);
        let tip_before = chain.tip().unwrap();

        // Competing branch from genesis; needs eight blocks to out-work
        // the active chain, putting the fork point seven blocks deep
        let mut parent = genesis;
        let mut blocks = Vec::new();
        for i in 0..8u8 {
            let block = mine_on(
                &chain,
                &parent,
                Vec::new(),
                parent.timestamp + 300,
                &[b'f', i],
            );
            blocks.push(block.clone());
            parent = block;
        }
        for block in &blocks[..7] {
            assert_eq!(chain.add_block(block).unwrap(), ApplyOutcome::SideChain);
        }
        match chain.add_block(&blocks[7]) {
            Err(NodeError::Fork(ForkError::NoCommonAncestor(_))) => {}
            other => panic!("expected NoCommonAncestor, got {:?}", other.map(|_| ())),
        }

        // Original tip untouched
        assert_eq!(chain.tip().unwrap(), tip_before);
    }

    #[test]
    fn test_orphan_rejected() {
        let (chain, _) = new_chain();
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        let lost = mine_on(&chain, &genesis, Vec::new(), T0 + 600, b"lost");
        let orphan = mine_on(&chain, &lost, Vec::new(), T0 + 1200, b"orphan");

        match chain.add_block(&orphan) {
            Err(NodeError::Validation(ValidationError::OrphanBlock(hash))) => {
                assert_eq!(hash, lost.hash);
            }
            other => panic!("expected OrphanBlock, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_difficulty_schedule_over_interval() {
        let (chain, _) = new_chain();

        // Heights 2 through 9 inherit the genesis difficulty
        let mut parent = chain.block_by_height(1).unwrap().unwrap();
        for i in 0..8u8 {
            let block = mine_on(&chain, &parent, Vec::new(), parent.timestamp + 60, &[i]);
            assert_eq!(block.difficulty, pow::INITIAL_DIFFICULTY);
            assert_eq!(chain.add_block(&block).unwrap(), ApplyOutcome::Extended);
            parent = block;
        }

        // Height 10 sits on the interval; 60s spacing is far below half
        // the 600s target, so difficulty rises by ceil(x1.2)
        let block = mine_on(&chain, &parent, Vec::new(), parent.timestamp + 60, &[99]);
        assert_eq!(
            block.difficulty,
            (pow::INITIAL_DIFFICULTY * 6).div_ceil(5)
        );
        assert_eq!(chain.add_block(&block).unwrap(), ApplyOutcome::Extended);
    }

    #[test]
    fn test_checkpoint_recorded_and_enforced() {
        let (chain, _) = new_chain();
        extend(&chain, 11);

        let at_10 = chain.block_by_height(10).unwrap().unwrap();
        let tip = chain.tip().unwrap();

        // The pin exists
        let genesis = chain.block_by_height(1).unwrap().unwrap();
        assert!(chain.has_block(&at_10.hash).unwrap());
        assert_eq!(genesis.height, 1);
        assert_eq!(tip.height, 12);

        // A branch diverging below the checkpoint cannot be applied: its
        // parent at height >= 10 is not on the pinned path
        let at_9 = chain.block_by_height(9).unwrap().unwrap();
        let rogue10 = mine_on(&chain, &at_9, Vec::new(), at_9.timestamp + 90, b"r10");
        assert_eq!(chain.add_block(&rogue10).unwrap(), ApplyOutcome::SideChain);
        let rogue11 = mine_on(&chain, &rogue10, Vec::new(), at_9.timestamp + 180, b"r11");
        match chain.add_block(&rogue11) {
            Err(NodeError::Validation(ValidationError::CheckpointMismatch(height))) => {
                assert_eq!(height, 10);
            }
            other => panic!("expected CheckpointMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tip_announcements() {
        let (chain, _) = new_chain();
        let mut rx = chain.subscribe();
        extend(&chain, 1);

        let announce = rx.try_recv().unwrap();
        assert_eq!(announce.height, 2);
        assert_eq!(announce.hash, chain.tip().unwrap().hash);
    }
}
