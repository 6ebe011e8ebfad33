// Miner loop
//
// idle -> building -> racing -> committed or aborted. While the hash
// search runs, a listener watches the chain's tip announcements; a block
// arriving at or above the candidate height cancels the search within
// one nonce step.

use crate::chain::{ApplyOutcome, Blockchain, Mempool, PoolBucket, TipAnnounce};
use crate::consensus::pow;
use crate::error::NodeError;
use crate::network::gossip::GossipHub;
use crate::network::message::{HeaderAnnounce, InvKind, Inventory, Message};
use crate::network::sync::SyncManager;
use crate::storage::UtxoSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Miner {
    chain: Arc<Blockchain>,
    utxo: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    sync: Arc<SyncManager>,
    hub: Arc<GossipHub>,
    reward_pub_key_hash: [u8; 20],
    /// How many pending transactions one attempt claims
    batch: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Cancel `token` as soon as an announcement at or above `height`
/// arrives.
pub fn spawn_race_listener(
    mut rx: broadcast::Receiver<TipAnnounce>,
    height: u64,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(announce) = rx.recv().await {
            if announce.height >= height {
                log::debug!(
                    "competing block {} at height {} observed",
                    announce.hash,
                    announce.height
                );
                token.cancel();
                break;
            }
        }
    })
}

impl Miner {
    pub fn new(
        chain: Arc<Blockchain>,
        utxo: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        sync: Arc<SyncManager>,
        hub: Arc<GossipHub>,
        reward_pub_key_hash: [u8; 20],
        batch: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            utxo,
            mempool,
            sync,
            hub,
            reward_pub_key_hash,
            batch,
        })
    }

    /// Periodic assembly loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.attempt(&shutdown).await {
                log::warn!("mining attempt failed: {}", e);
            }
        }
    }

    /// One build/race cycle. Returns the committed block hash, or None
    /// when there was nothing to mine or the attempt was aborted.
    pub async fn attempt(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<crate::core::Hash256>, NodeError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(None);
        };
        if !self.sync.is_synced(tip.height, &tip.work) {
            log::debug!("not synced yet, skipping mining tick");
            return Ok(None);
        }

        // building: claim pending transactions for this attempt
        let claimed = self.mempool.claim_pending(self.batch);
        if claimed.is_empty() {
            return Ok(None);
        }

        let announcements = self.chain.subscribe();
        let parent = self
            .chain
            .block_by_hash(&tip.hash)?
            .ok_or(crate::error::StoreError::MissingBlock(tip.hash))?;
        let timestamp = unix_now().max(parent.timestamp + 1);
        let entropy = rand::random::<[u8; 8]>().to_vec();
        let candidate = self.chain.build_candidate(
            claimed.clone(),
            &self.reward_pub_key_hash,
            timestamp,
            entropy,
        )?;
        let height = candidate.height;

        // racing: a competing announcement at our height aborts the search
        let race = shutdown.child_token();
        let listener = spawn_race_listener(announcements, height, race.clone());

        let search_token = race.clone();
        let mined = tokio::task::spawn_blocking(move || {
            let mut block = candidate;
            if pow::mine(&mut block, &search_token) {
                Some(block)
            } else {
                None
            }
        })
        .await
        .map_err(|e| NodeError::Internal(format!("hash search task failed: {}", e)))?;
        listener.abort();

        let Some(block) = mined else {
            self.abort(claimed)?;
            return Ok(None);
        };

        match self.chain.add_block(&block) {
            Ok(ApplyOutcome::Extended) => {
                self.utxo.update(&block)?;
                self.commit(&block);
                Ok(Some(block.hash))
            }
            Ok(ApplyOutcome::Reorganized { .. }) => {
                self.utxo.compute(self.chain.iter())?;
                self.commit(&block);
                Ok(Some(block.hash))
            }
            Ok(outcome) => {
                // Lost the race at commit time
                log::info!(
                    "mined block {} at height {} superseded ({:?})",
                    block.hash,
                    height,
                    outcome
                );
                self.abort(claimed)?;
                Ok(None)
            }
            Err(e) => {
                self.abort(claimed)?;
                Err(e)
            }
        }
    }

    // committed: announce the block and flush the pool
    fn commit(&self, block: &crate::core::Block) {
        self.mempool.clear_all();
        log::info!("mined block {} at height {}", block.hash, block.height);

        self.hub.publish(
            &Message::Inv(Inventory {
                kind: InvKind::Block,
                hashes: vec![block.hash],
            }),
            &HashSet::new(),
        );
        if let Some(tip) = self.chain.tip() {
            self.hub.publish(
                &Message::BlockHeader(HeaderAnnounce {
                    height: tip.height,
                    hash: tip.hash,
                    work: tip.work,
                }),
                &HashSet::new(),
            );
        }
    }

    // aborted: hand claimed transactions back to `pending`, except the
    // ones the competing block already mined
    fn abort(&self, claimed: Vec<crate::core::Transaction>) -> Result<(), NodeError> {
        log::info!("mining attempt aborted, returning {} transactions", claimed.len());
        for tx in claimed {
            if self.chain.find_transaction(&tx.id)?.is_some() {
                self.mempool.remove_from_all(&tx.id);
            } else {
                self.mempool.move_to(tx, PoolBucket::Pending);
            }
        }
        Ok(())
    }
}
