// Peer protocol layer: framing, gossip overlay, sync, dispatch

pub mod dedup;
pub mod gossip;
pub mod handlers;
pub mod message;
pub mod peer;
pub mod peerstore;
pub mod sync;
pub mod worker;

pub use dedup::SeenCache;
pub use gossip::{GossipHub, NetEvent};
pub use handlers::Handlers;
pub use message::{Channel, Command, Greeting, HeaderAnnounce, InvKind, Inventory, Locator, Message};
pub use peer::PeerHandle;
pub use peerstore::{PeerBook, PeerRecord};
pub use sync::{PeerStatus, SyncManager};
pub use worker::{Dispatcher, OverflowPolicy};
