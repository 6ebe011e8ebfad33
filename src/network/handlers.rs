// Command handlers
//
// Every decoded frame lands here via the worker dispatcher. Handlers are
// idempotent: re-delivery of a known block or transaction is a logged
// no-op, whether or not the gossip layer suppressed the duplicate.

use crate::chain::{ApplyOutcome, Blockchain, Mempool};
use crate::core::{Block, Hash256, Transaction};
use crate::error::NodeError;
use crate::network::dedup::SeenCache;
use crate::network::gossip::{GossipHub, NetEvent};
use crate::network::message::{HeaderAnnounce, InvKind, Inventory, Locator, Message};
use crate::network::sync::SyncManager;
use crate::storage::UtxoSet;
use std::collections::HashSet;
use std::sync::Arc;

/// Cap on hashes in one inventory reply
const MAX_INV: usize = 500;

/// Cap on transactions handed out per pool pull
const MAX_POOL_PULL: u32 = 200;

pub struct Handlers {
    chain: Arc<Blockchain>,
    utxo: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    sync: Arc<SyncManager>,
    seen: Arc<SeenCache>,
    hub: Arc<GossipHub>,
}

impl Handlers {
    pub fn new(
        chain: Arc<Blockchain>,
        utxo: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        sync: Arc<SyncManager>,
        seen: Arc<SeenCache>,
        hub: Arc<GossipHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            utxo,
            mempool,
            sync,
            seen,
            hub,
        })
    }

    /// Entry point for the worker dispatcher
    pub async fn handle(&self, event: NetEvent) {
        match event {
            NetEvent::PeerConnected { peer } => {
                log::info!("peer {} connected", peer);
                self.announce_tip_to(&peer);
            }
            NetEvent::PeerDisconnected { peer } => {
                log::info!("peer {} disconnected", peer);
                self.sync.remove_peer(&peer);
            }
            NetEvent::Frame { peer, message } => {
                self.seen.mark_seen(&message.gossip_id(), &peer);
                if let Err(e) = self.dispatch(&peer, message) {
                    log::warn!("dropping message from {}: {}", peer, e);
                }
            }
        }
    }

    fn dispatch(&self, peer: &str, message: Message) -> Result<(), NodeError> {
        match message {
            Message::Version(_) => {
                // Greetings are consumed during connection setup
                log::debug!("ignoring stray version frame from {}", peer);
                Ok(())
            }
            Message::BlockHeader(header) => self.on_block_header(peer, header),
            Message::GetBlocks(locator) => self.on_get_blocks(peer, locator),
            Message::Inv(inv) => self.on_inv(peer, inv),
            Message::GetData(inv) => self.on_get_data(peer, inv),
            Message::Block(block) => self.on_block(peer, *block),
            Message::Tx(tx) => self.on_tx(peer, tx),
            Message::GetTxFromPool { count } => self.on_pool_pull(peer, count),
        }
    }

    /// Send our tip header to one peer
    pub fn announce_tip_to(&self, peer: &str) {
        if let Some(tip) = self.chain.tip() {
            self.reply(
                peer,
                &Message::BlockHeader(HeaderAnnounce {
                    height: tip.height,
                    hash: tip.hash,
                    work: tip.work,
                }),
            );
        }
    }

    /// Broadcast our tip header to every general-channel peer
    pub fn announce_tip_all(&self) {
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

    // The peer may have vanished between receipt and reply; that is not
    // worth more than a debug line.
    fn reply(&self, peer: &str, message: &Message) {
        if let Err(e) = self.hub.send_to(peer, message) {
            log::debug!("reply to {} failed: {}", peer, e);
        }
    }

    fn on_block_header(&self, peer: &str, header: HeaderAnnounce) -> Result<(), NodeError> {
        self.sync
            .record_header(peer, header.height, header.work.clone());

        let (local_height, local_hash) = match self.chain.tip() {
            Some(tip) => (tip.height, tip.hash),
            None => (0, Hash256::zero()),
        };

        if header.height > local_height {
            // The sender is ahead: ask for everything past our tip
            self.reply(
                peer,
                &Message::GetBlocks(Locator {
                    height: local_height,
                    hash: local_hash,
                }),
            );
        } else if local_height > header.height {
            // We are ahead: let the peer catch up from us
            self.announce_tip_to(peer);
        } else {
            self.sync.mark_synced(peer);
        }
        Ok(())
    }

    fn on_get_blocks(&self, peer: &str, locator: Locator) -> Result<(), NodeError> {
        let mut hashes = self.chain.hashes_above(locator.height)?;
        hashes.truncate(MAX_INV);
        if !hashes.is_empty() {
            self.reply(
                peer,
                &Message::Inv(Inventory {
                    kind: InvKind::Block,
                    hashes,
                }),
            );
        }
        Ok(())
    }

    fn on_inv(&self, peer: &str, inv: Inventory) -> Result<(), NodeError> {
        let mut wanted = Vec::new();
        match inv.kind {
            InvKind::Block => {
                for hash in inv.hashes {
                    if !self.chain.has_block(&hash)? {
                        wanted.push(hash);
                    }
                }
            }
            InvKind::Tx => {
                for hash in inv.hashes {
                    if !self.mempool.contains(&hash) {
                        wanted.push(hash);
                    }
                }
            }
        }
        if !wanted.is_empty() {
            self.reply(
                peer,
                &Message::GetData(Inventory {
                    kind: inv.kind,
                    hashes: wanted,
                }),
            );
        }
        Ok(())
    }

    fn on_get_data(&self, peer: &str, inv: Inventory) -> Result<(), NodeError> {
        match inv.kind {
            InvKind::Block => {
                for hash in inv.hashes {
                    if let Some(block) = self.chain.block_by_hash(&hash)? {
                        self.reply(peer, &Message::Block(Box::new(block)));
                    }
                }
            }
            InvKind::Tx => {
                for hash in inv.hashes {
                    if let Some(tx) = self.mempool.get(&hash) {
                        self.reply(peer, &Message::Tx(tx));
                    }
                }
            }
        }
        Ok(())
    }

    fn on_block(&self, peer: &str, block: Block) -> Result<(), NodeError> {
        if self.chain.has_block(&block.hash)? {
            log::debug!("already have block {}", block.hash);
            return Ok(());
        }

        match self.chain.add_block(&block) {
            Ok(ApplyOutcome::Extended) => {
                self.utxo.update(&block)?;
                self.after_accept(&block);
            }
            Ok(ApplyOutcome::Reorganized { .. }) => {
                // Returned transactions flow through the chain's hook;
                // the derived set is rebuilt from the new active chain
                self.utxo.compute(self.chain.iter())?;
                self.after_accept(&block);
            }
            Ok(ApplyOutcome::SideChain) => {
                log::debug!("stored side block {} from {}", block.hash, peer);
            }
            Ok(ApplyOutcome::AlreadyKnown) => {}
            Err(NodeError::Validation(e)) => {
                log::warn!("rejecting block {} from {}: {}", block.hash, peer, e);
            }
            Err(NodeError::Fork(e)) => {
                log::warn!("rejecting branch at {} from {}: {}", block.hash, peer, e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // Bookkeeping shared by both accept paths: drop mined transactions
    // from the pool, relay the block, start another header round.
    fn after_accept(&self, block: &Block) {
        for id in block.tx_ids() {
            self.mempool.remove_from_all(&id);
        }
        log::info!("accepted block {} at height {}", block.hash, block.height);

        let inv = Message::Inv(Inventory {
            kind: InvKind::Block,
            hashes: vec![block.hash],
        });
        let skip = self.seen.seen_by(&inv.gossip_id());
        self.hub.publish(&inv, &skip);
        self.announce_tip_all();
    }

    fn on_tx(&self, peer: &str, tx: Transaction) -> Result<(), NodeError> {
        if self.mempool.contains(&tx.id) {
            log::debug!("transaction {} already pooled", tx.id);
            return Ok(());
        }
        if self.chain.find_transaction(&tx.id)?.is_some() {
            log::debug!("transaction {} already mined", tx.id);
            return Ok(());
        }

        match self.chain.verify_transaction(&tx) {
            Ok(()) => {}
            Err(NodeError::Validation(e)) => {
                log::warn!("rejecting transaction {} from {}: {}", tx.id, peer, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.mempool.add(tx.clone());
        log::debug!("pooled transaction {}", tx.id);

        let message = Message::Tx(tx);
        let skip = self.seen.seen_by(&message.gossip_id());
        self.hub.publish(&message, &skip);
        Ok(())
    }

    fn on_pool_pull(&self, peer: &str, count: u32) -> Result<(), NodeError> {
        let count = count.min(MAX_POOL_PULL) as usize;
        for tx in self.mempool.pending_sample(count) {
            self.reply(peer, &Message::Tx(tx));
        }
        Ok(())
    }
}
