// orecoin: a peer-to-peer proof-of-work ledger node

pub mod chain;
pub mod cli;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod error;
pub mod network;
pub mod node;
pub mod storage;

// Re-exports for convenience
pub use chain::{ApplyOutcome, Blockchain, Mempool, TipInfo};
pub use cli::{Cli, CliHandler};
pub use core::{Block, Hash256, Transaction, TxInput, TxOutput};
pub use crypto::{Address, KeyPair};
pub use error::{NodeError, ValidationError};
pub use network::{Dispatcher, GossipHub, Handlers, Message, OverflowPolicy, SyncManager};
pub use node::{Miner, Node, NodeConfig};
pub use storage::{ChainStore, UtxoSet};
