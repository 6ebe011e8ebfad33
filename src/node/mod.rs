// Node context
//
// Owns every component: ledger, UTXO set, mempool, sync state, gossip
// hub, worker dispatcher, peer book, and the miner. Nothing lives in
// globals, so several independent nodes can share one process.

pub mod miner;

pub use miner::Miner;

use crate::chain::{Blockchain, Mempool};
use crate::core::{Block, Hash256, Transaction, TxOutput};
use crate::crypto::Address;
use crate::error::{NodeError, StoreError};
use crate::network::dedup::SeenCache;
use crate::network::gossip::{GossipHub, NetEvent};
use crate::network::handlers::Handlers;
use crate::network::message::Message;
use crate::network::peerstore::PeerBook;
use crate::network::sync::SyncManager;
use crate::network::worker::{Dispatcher, HandlerFn, OverflowPolicy};
use crate::storage::{ChainStore, UtxoSet};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Where the ledger and peer book live; None keeps everything in
    /// memory (tests)
    pub data_dir: Option<PathBuf>,
    pub listen_addr: Option<SocketAddr>,
    /// Peers to dial on startup, in addition to the remembered ones
    pub bootstrap: Vec<String>,
    pub miner: bool,
    pub reward_address: Option<Address>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub peer_ttl: Duration,
    pub seen_ttl: Duration,
    pub sweep_interval: Duration,
    pub announce_interval: Duration,
    pub pool_pull_interval: Duration,
    pub pool_pull_batch: u32,
    pub mine_interval: Duration,
    pub mine_batch: usize,
    pub peer_max_age: Duration,
    pub peer_max_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            listen_addr: None,
            bootstrap: Vec::new(),
            miner: false,
            reward_address: None,
            workers: 4,
            queue_capacity: 256,
            overflow: OverflowPolicy::DropNewest,
            peer_ttl: Duration::from_secs(120),
            seen_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            announce_interval: Duration::from_secs(30),
            pool_pull_interval: Duration::from_secs(20),
            pool_pull_batch: 50,
            mine_interval: Duration::from_secs(10),
            mine_batch: 100,
            peer_max_age: Duration::from_secs(7 * 24 * 3600),
            peer_max_failures: 5,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Node {
    pub chain: Arc<Blockchain>,
    pub utxo: Arc<UtxoSet>,
    pub mempool: Arc<Mempool>,
    pub sync: Arc<SyncManager>,
    pub seen: Arc<SeenCache>,
    pub hub: Arc<GossipHub>,
    pub book: Arc<PeerBook>,
    handlers: Arc<Handlers>,
    cfg: NodeConfig,
    events_rx: Option<mpsc::Receiver<NetEvent>>,
    persist_peers: bool,
    cancel: CancellationToken,
}

impl Node {
    /// Open storage and wire the components. Failures here are fatal:
    /// the node cannot run without a consistent ledger.
    pub fn open(cfg: NodeConfig) -> Result<Self, NodeError> {
        let (db, persist_peers, book_path) = match &cfg.data_dir {
            Some(dir) => {
                let db = sled::open(dir.join("chain")).map_err(StoreError::from)?;
                (db, true, dir.join("peers.json"))
            }
            None => {
                let db = sled::Config::new()
                    .temporary(true)
                    .open()
                    .map_err(StoreError::from)?;
                // Never written in memory-only mode; the path just has to
                // be absent so the book starts empty
                let nonce = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let path = std::env::temp_dir().join(format!(
                    "orecoin-peers-{}-{}.json",
                    std::process::id(),
                    nonce
                ));
                (db, false, path)
            }
        };

        let chain = Arc::new(Blockchain::open(ChainStore::new(db.clone()))?);
        let utxo = Arc::new(UtxoSet::new(db));
        let mempool = Arc::new(Mempool::new());
        let sync = Arc::new(SyncManager::new(cfg.peer_ttl));
        let seen = Arc::new(SeenCache::new(cfg.seen_ttl));
        let book = Arc::new(PeerBook::load(book_path)?);

        let (events_tx, events_rx) = mpsc::channel(512);
        let listen_text = cfg
            .listen_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let hub = GossipHub::new(chain.clone(), cfg.miner, listen_text, events_tx);

        let handlers = Handlers::new(
            chain.clone(),
            utxo.clone(),
            mempool.clone(),
            sync.clone(),
            seen.clone(),
            hub.clone(),
        );

        // Reorged-out transactions go back to the pool and onto the wire
        {
            let mempool = mempool.clone();
            let hub = hub.clone();
            chain.set_returned_hook(Box::new(move |txs| {
                for tx in txs {
                    log::info!("returning transaction {} to the pool", tx.id);
                    let message = Message::Tx(tx.clone());
                    if mempool.add(tx) {
                        hub.publish(&message, &HashSet::new());
                    }
                }
            }));
        }

        Ok(Self {
            chain,
            utxo,
            mempool,
            sync,
            seen,
            hub,
            book,
            handlers,
            cfg,
            events_rx: Some(events_rx),
            persist_peers,
            cancel: CancellationToken::new(),
        })
    }

    /// Launch every background task. Returns the bound listen address
    /// when listening was requested.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>, NodeError> {
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| NodeError::Internal("node already started".into()))?;

        // Worker dispatch: decoded events fan out to the handlers
        let handler_fn: HandlerFn = {
            let handlers = self.handlers.clone();
            Arc::new(move |event| {
                let handlers = handlers.clone();
                Box::pin(async move { handlers.handle(event).await })
            })
        };
        let dispatcher = Arc::new(Dispatcher::start(
            self.cfg.workers,
            self.cfg.queue_capacity,
            self.cfg.overflow,
            handler_fn,
            self.cancel.clone(),
        ));
        self.spawn_event_feed(events_rx, dispatcher);

        let bound = match self.cfg.listen_addr {
            Some(addr) => Some(self.hub.listen(addr, self.cancel.clone()).await?),
            None => None,
        };

        self.dial_known_peers().await;
        self.spawn_tickers();
        self.spawn_miner();

        Ok(bound)
    }

    /// Start and block until shutdown
    pub async fn run(mut self) -> Result<(), NodeError> {
        self.start().await?;
        self.cancel.cancelled().await;
        Ok(())
    }

    /// Stop every background task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_event_feed(&self, mut events_rx: mpsc::Receiver<NetEvent>, dispatcher: Arc<Dispatcher>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events_rx.recv() => event,
                };
                let Some(event) = event else { break };
                if let Err(e) = dispatcher.submit(event).await {
                    log::debug!("dispatcher rejected an event: {}", e);
                }
            }
        });
    }

    async fn dial_known_peers(&self) {
        let mut targets = self.cfg.bootstrap.clone();
        for addr in self.book.addresses() {
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        for addr in targets {
            match self.hub.dial(&addr, self.cancel.clone()).await {
                Ok(()) => self.book.record_success(&addr),
                Err(e) => {
                    log::warn!("dial {} failed: {}", addr, e);
                    self.book.record_failure(&addr);
                }
            }
        }
    }

    fn spawn_tickers(&self) {
        // Periodic tip announcement keeps lagging peers pulling
        {
            let handlers = self.handlers.clone();
            let cancel = self.cancel.clone();
            let interval = self.cfg.announce_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => handlers.announce_tip_all(),
                    }
                }
            });
        }

        // Health sweep: stale sync peers, stale seen entries, peer book
        {
            let sync = self.sync.clone();
            let seen = self.seen.clone();
            let book = self.book.clone();
            let hub = self.hub.clone();
            let persist = self.persist_peers;
            let cancel = self.cancel.clone();
            let interval = self.cfg.sweep_interval;
            let max_age = self.cfg.peer_max_age;
            let max_failures = self.cfg.peer_max_failures;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            for peer in sync.sweep() {
                                log::info!("peer {} timed out of sync tracking", peer);
                            }
                            seen.sweep();
                            // Connected peers stay fresh in the book
                            for addr in hub.peer_listen_addrs() {
                                book.record_success(&addr);
                            }
                            book.prune(max_age, max_failures);
                            if persist {
                                if let Err(e) = book.save() {
                                    log::warn!("failed to persist peer book: {}", e);
                                }
                            }
                        }
                    }
                }
            });
        }

        // Miners periodically pull transactions from full-node pools
        if self.cfg.miner {
            let hub = self.hub.clone();
            let cancel = self.cancel.clone();
            let interval = self.cfg.pool_pull_interval;
            let batch = self.cfg.pool_pull_batch;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            hub.publish(&Message::GetTxFromPool { count: batch }, &HashSet::new());
                        }
                    }
                }
            });
        }
    }

    fn spawn_miner(&self) {
        if !self.cfg.miner {
            return;
        }
        let Some(address) = &self.cfg.reward_address else {
            log::warn!("mining enabled but no reward address configured");
            return;
        };
        let reward = match address.to_pubkey_hash() {
            Ok(hash) => hash,
            Err(_) => {
                log::warn!("mining disabled: reward address {} is invalid", address);
                return;
            }
        };

        let miner = Miner::new(
            self.chain.clone(),
            self.utxo.clone(),
            self.mempool.clone(),
            self.sync.clone(),
            self.hub.clone(),
            reward,
            self.cfg.mine_batch,
        );
        tokio::spawn(miner.run(self.cfg.mine_interval, self.cancel.clone()));
    }

    // --- public command/query surface (consumed by the RPC facade) ---

    /// Mine the genesis block and seed the UTXO set
    pub fn create_genesis(&self, reward_to: &Address) -> Result<Block, NodeError> {
        let genesis = self.chain.create_genesis(reward_to, unix_now())?;
        self.utxo.update(&genesis)?;
        Ok(genesis)
    }

    /// Validate a transaction, stage it, and gossip it
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, NodeError> {
        self.chain.verify_transaction(&tx)?;
        let id = tx.id;
        let message = Message::Tx(tx.clone());
        if self.mempool.add(tx) {
            self.hub.publish(&message, &HashSet::new());
        }
        Ok(id)
    }

    /// Spendable balance of an address
    pub fn balance_of(&self, address: &Address) -> Result<u64, NodeError> {
        let hash = address.to_pubkey_hash()?;
        Ok(self.utxo.balance(&hash)?)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, NodeError> {
        Ok(self.chain.block_by_hash(hash)?)
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, NodeError> {
        Ok(self.chain.block_by_height(height)?)
    }

    pub fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>, NodeError> {
        Ok(self.chain.blocks_in_range(from, to)?)
    }

    /// The full UTXO snapshot
    pub fn utxo_snapshot(&self) -> Result<Vec<(Hash256, Vec<(u32, TxOutput)>)>, NodeError> {
        Ok(self.utxo.snapshot()?)
    }

    pub fn best_height(&self) -> u64 {
        self.chain.best_height()
    }

    pub fn peer_count(&self) -> usize {
        self.hub.peer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::pow;
    use crate::core::{GENESIS_REWARD, TxInput};
    use crate::crypto::KeyPair;
    use std::collections::HashMap;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn memory_node(listen: bool, bootstrap: Vec<String>) -> Node {
        let cfg = NodeConfig {
            listen_addr: listen.then(|| "127.0.0.1:0".parse().unwrap()),
            bootstrap,
            announce_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(3600),
            ..NodeConfig::default()
        };
        Node::open(cfg).unwrap()
    }

    fn mine_child(node: &Node, txs: Vec<Transaction>) -> Block {
        let tip = node.chain.tip().unwrap();
        let parent = node.chain.block_by_hash(&tip.hash).unwrap().unwrap();
        let key = KeyPair::generate();
        let mut block = node
            .chain
            .candidate_on(
                &parent,
                txs,
                &key.pubkey_hash(),
                parent.timestamp + 1,
                b"n".to_vec(),
            )
            .unwrap();
        assert!(pow::mine(&mut block, &CancellationToken::new()));
        block
    }

    #[test]
    fn test_genesis_and_queries() {
        let node = memory_node(false, Vec::new());
        let key = KeyPair::generate();
        node.create_genesis(&key.address).unwrap();

        assert_eq!(node.best_height(), 1);
        assert_eq!(node.balance_of(&key.address).unwrap(), GENESIS_REWARD);

        let genesis = node.block_by_height(1).unwrap().unwrap();
        assert!(node.block_by_hash(&genesis.hash).unwrap().is_some());
        assert_eq!(node.blocks_in_range(1, 10).unwrap().len(), 1);
        assert_eq!(node.utxo_snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_submit_transaction_validates() {
        let node = memory_node(false, Vec::new());
        let key = KeyPair::generate();
        node.create_genesis(&key.address).unwrap();

        let genesis = node.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();
        let recipient = KeyPair::generate();

        let mut tx = Transaction::new(
            vec![TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        let id = node.submit_transaction(tx.clone()).unwrap();
        assert_eq!(id, tx.id);
        assert!(node.mempool.contains(&tx.id));

        // A tampered copy is refused
        let mut bad = tx;
        bad.outputs[0].value += 1;
        assert!(node.submit_transaction(bad).is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_sync_to_one_chain() {
        let mut node_a = memory_node(true, Vec::new());
        let key = KeyPair::generate();
        node_a.create_genesis(&key.address).unwrap();

        // Give A a head start of two blocks
        for _ in 0..2 {
            let block = mine_child(&node_a, Vec::new());
            node_a.chain.add_block(&block).unwrap();
            node_a.utxo.update(&block).unwrap();
        }
        assert_eq!(node_a.best_height(), 3);

        let addr = node_a.start().await.unwrap().unwrap();

        let mut node_b = memory_node(false, vec![addr.to_string()]);
        node_b.start().await.unwrap();

        timeout(Duration::from_secs(15), async {
            while node_b.best_height() < 3 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("node B should sync to node A's chain");

        assert_eq!(
            node_b.chain.tip().unwrap().hash,
            node_a.chain.tip().unwrap().hash
        );
        // The derived UTXO view followed the synced chain
        assert_eq!(node_b.balance_of(&key.address).unwrap(), GENESIS_REWARD);

        node_a.shutdown();
        node_b.shutdown();
    }

    #[tokio::test]
    async fn test_transaction_gossip_between_nodes() {
        let mut node_a = memory_node(true, Vec::new());
        let key = KeyPair::generate();
        node_a.create_genesis(&key.address).unwrap();
        let addr = node_a.start().await.unwrap().unwrap();

        let mut node_b = memory_node(false, vec![addr.to_string()]);
        node_b.start().await.unwrap();

        // Wait for B to catch up to the genesis chain first
        timeout(Duration::from_secs(15), async {
            while node_b.best_height() < 1 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("node B should receive the genesis block");

        let genesis = node_a.block_by_height(1).unwrap().unwrap();
        let coinbase = genesis.transactions[0].clone();
        let recipient = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![TxInput::new(coinbase.id, 0, key.pubkey_bytes())],
            vec![TxOutput::new(
                GENESIS_REWARD,
                recipient.pubkey_hash().to_vec(),
            )],
        );
        tx.finalize(2);
        let prev_txs = HashMap::from([(coinbase.id, coinbase)]);
        crate::crypto::sign_inputs(&mut tx, &key, &prev_txs).unwrap();

        node_a.submit_transaction(tx.clone()).unwrap();

        timeout(Duration::from_secs(15), async {
            while !node_b.mempool.contains(&tx.id) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("the transaction should gossip to node B");

        node_a.shutdown();
        node_b.shutdown();
    }
}
