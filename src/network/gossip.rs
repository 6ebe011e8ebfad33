// Gossip overlay: channel-scoped publish/subscribe over framed TCP
//
// The hub owns every peer connection. Inbound frames are decoded and
// forwarded as events; the dispatcher fans them out to handlers. Outbound
// traffic goes through bounded per-peer queues.

use crate::chain::Blockchain;
use crate::error::NetError;
use crate::network::message::{Greeting, Message};
use crate::network::peer::{
    OUTBOUND_QUEUE, PeerHandle, channels_for, exchange_greetings, read_frame,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Network events consumed by the worker dispatcher
#[derive(Debug, Clone)]
pub enum NetEvent {
    PeerConnected { peer: String },
    PeerDisconnected { peer: String },
    Frame { peer: String, message: Message },
}

pub struct GossipHub {
    chain: Arc<Blockchain>,
    peers: RwLock<HashMap<String, PeerHandle>>,
    events: mpsc::Sender<NetEvent>,
    miner: bool,
    listen_addr: String,
}

impl GossipHub {
    pub fn new(
        chain: Arc<Blockchain>,
        miner: bool,
        listen_addr: String,
        events: mpsc::Sender<NetEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            peers: RwLock::new(HashMap::new()),
            events,
            miner,
            listen_addr,
        })
    }

    fn greeting(&self) -> Greeting {
        Greeting {
            height: self.chain.best_height(),
            miner: self.miner,
            listen_addr: self.listen_addr.clone(),
        }
    }

    /// Bind and start accepting connections. Returns the bound address.
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<SocketAddr, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        log::info!("listening for peers on {}", bound);

        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let hub = hub.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                hub.run_peer(stream, remote.to_string(), cancel).await;
                            });
                        }
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                        }
                    },
                }
            }
        });
        Ok(bound)
    }

    /// Connect out to a peer and start its read/write loops.
    pub async fn dial(
        self: &Arc<Self>,
        addr: &str,
        cancel: CancellationToken,
    ) -> Result<(), NetError> {
        let stream = TcpStream::connect(addr).await?;
        let peer_id = stream.peer_addr()?.to_string();
        log::info!("connected to peer {}", peer_id);

        let hub = self.clone();
        tokio::spawn(async move {
            hub.run_peer(stream, peer_id, cancel).await;
        });
        Ok(())
    }

    async fn run_peer(self: Arc<Self>, mut stream: TcpStream, peer_id: String, cancel: CancellationToken) {
        let theirs = match exchange_greetings(&mut stream, self.greeting()).await {
            Ok(theirs) => theirs,
            Err(e) => {
                log::warn!("greeting with {} failed: {}", peer_id, e);
                return;
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

        let handle = PeerHandle {
            id: peer_id.clone(),
            listen_addr: theirs.listen_addr.clone(),
            channels: channels_for(&theirs),
            outbound: outbound_tx,
        };
        self.peers.write().unwrap().insert(peer_id.clone(), handle);
        let _ = self
            .events
            .send(NetEvent::PeerConnected {
                peer: peer_id.clone(),
            })
            .await;

        // Writer task drains the outbound queue
        let writer_peer = peer_id.clone();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    log::debug!("write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        self.read_loop(read_half, &peer_id, cancel).await;

        writer.abort();
        self.peers.write().unwrap().remove(&peer_id);
        let _ = self
            .events
            .send(NetEvent::PeerDisconnected { peer: peer_id })
            .await;
    }

    async fn read_loop(
        &self,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        peer_id: &str,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            let (tag, payload) = match frame {
                Ok(frame) => frame,
                Err(NetError::Io(e)) => {
                    log::debug!("peer {} disconnected: {}", peer_id, e);
                    break;
                }
                Err(e) => {
                    log::warn!("dropping malformed frame from {}: {}", peer_id, e);
                    break;
                }
            };

            match Message::decode(&tag, &payload) {
                Ok(message) => {
                    let _ = self
                        .events
                        .send(NetEvent::Frame {
                            peer: peer_id.to_string(),
                            message,
                        })
                        .await;
                }
                Err(e) => {
                    // Unknown commands and bad payloads are logged and
                    // dropped; the frame boundary keeps the stream usable
                    log::warn!("dropping message from {}: {}", peer_id, e);
                }
            }
        }
    }

    /// Fan a message out to every peer subscribed to its channel, minus
    /// the peers in `skip`. Returns how many peers it was queued for.
    pub fn publish(&self, message: &Message, skip: &HashSet<String>) -> usize {
        let channel = message.channel();
        let frame = message.encode();
        let peers = self.peers.read().unwrap();

        let mut sent = 0;
        for handle in peers.values() {
            if handle.channels.contains(&channel) && !skip.contains(&handle.id) {
                handle.enqueue(frame.clone());
                sent += 1;
            }
        }
        sent
    }

    /// Queue a message for one peer
    pub fn send_to(&self, peer: &str, message: &Message) -> Result<(), NetError> {
        let peers = self.peers.read().unwrap();
        let handle = peers
            .get(peer)
            .ok_or_else(|| NetError::UnknownPeer(peer.to_string()))?;
        handle.enqueue(message.encode());
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    /// Announced dial-back addresses of the connected peers
    pub fn peer_listen_addrs(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap()
            .values()
            .map(|handle| handle.listen_addr.clone())
            .filter(|addr| !addr.is_empty())
            .collect()
    }
}
