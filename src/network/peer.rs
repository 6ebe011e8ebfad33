// Framed peer connections

use crate::error::NetError;
use crate::network::message::{
    Channel, FRAME_HEADER_WIDTH, Greeting, Message, parse_frame_header,
};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Outbound queue depth per peer; frames beyond it are dropped
pub const OUTBOUND_QUEUE: usize = 256;

/// The channel memberships a greeting implies: every node takes part in
/// general gossip and raw transaction relay, miners additionally join
/// the mining channel.
pub fn channels_for(greeting: &Greeting) -> HashSet<Channel> {
    let mut channels = HashSet::from([Channel::General, Channel::FullNodes]);
    if greeting.miner {
        channels.insert(Channel::Mining);
    }
    channels
}

/// Registered connection state for one peer
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Peer id: the remote socket address
    pub id: String,
    /// Dial-back address announced in the greeting
    pub listen_addr: String,
    /// Channels the peer subscribes to
    pub channels: HashSet<Channel>,
    /// Outbound frame queue consumed by the peer's writer task
    pub outbound: mpsc::Sender<Vec<u8>>,
}

impl PeerHandle {
    /// Queue a frame for delivery. Frames are silently dropped (with a
    /// debug log) when the writer cannot keep up.
    pub fn enqueue(&self, frame: Vec<u8>) {
        if self.outbound.try_send(frame).is_err() {
            log::debug!("outbound queue full for {}, dropping frame", self.id);
        }
    }
}

/// Read one frame: fixed header, then payload
pub async fn read_frame<R>(reader: &mut R) -> Result<(String, Vec<u8>), NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_WIDTH];
    reader.read_exact(&mut header).await?;
    let (tag, len) = parse_frame_header(&header)?;

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((tag, payload))
}

/// Write one pre-encoded frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Exchange greetings on a fresh connection: send ours, expect theirs.
pub async fn exchange_greetings<S>(
    stream: &mut S,
    ours: Greeting,
) -> Result<Greeting, NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Message::Version(ours).encode()).await?;

    let (tag, payload) = read_frame(stream).await?;
    match Message::decode(&tag, &payload)? {
        Message::Version(theirs) => Ok(theirs),
        other => Err(NetError::UnknownCommand(format!(
            "expected version greeting, got {}",
            other.command().as_str()
        ))),
    }
}
