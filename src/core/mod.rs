// Core value types: hashes, serialization, transactions, blocks, merkle

pub mod block;
pub mod hash;
pub mod merkle;
pub mod serialize;
pub mod transaction;
pub mod types;

pub use block::Block;
pub use hash::{hash160, hash256, sha256};
pub use merkle::merkle_root;
pub use serialize::Serializable;
pub use transaction::{Transaction, TxInput, TxOutput};
pub use types::{BLOCK_REWARD, COIN, GENESIS_REWARD, Hash256};
