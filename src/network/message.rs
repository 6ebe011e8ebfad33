// Wire protocol: command framing and payload codecs
//
// Every frame is a 20-byte NUL-padded ASCII command tag, a u32 big-endian
// payload length, and the binary payload.

use crate::core::serialize::{
    read_biguint, read_hash, read_u32, read_u64, read_var_bytes, write_biguint, write_hash,
    write_u32, write_u64, write_var_bytes,
};
use crate::core::{Block, Hash256, Serializable, Transaction, hash256};
use crate::error::{CodecError, NetError};
use num_bigint::BigUint;
use std::io::{Cursor, Read};

/// Fixed width of the command tag
pub const COMMAND_WIDTH: usize = 20;

/// Command tag plus payload length
pub const FRAME_HEADER_WIDTH: usize = COMMAND_WIDTH + 4;

/// Upper bound on a single payload
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Logical gossip channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Blocks, headers, inventory, getdata; every node subscribes
    General,
    /// Transaction-pool pulls; miners only
    Mining,
    /// Raw transaction relay; full nodes and miners
    FullNodes,
}

/// Protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Tx,
    Block,
    BlockHeader,
    GetBlocks,
    GetData,
    Inv,
    GetTxFromPool,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::BlockHeader => "block_header",
            Command::GetBlocks => "getblocks",
            Command::GetData => "getdata",
            Command::Inv => "inv",
            Command::GetTxFromPool => "gettxfrompool",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "version" => Some(Command::Version),
            "tx" => Some(Command::Tx),
            "block" => Some(Command::Block),
            "block_header" => Some(Command::BlockHeader),
            "getblocks" => Some(Command::GetBlocks),
            "getdata" => Some(Command::GetData),
            "inv" => Some(Command::Inv),
            "gettxfrompool" => Some(Command::GetTxFromPool),
            _ => None,
        }
    }

    /// The channel a command travels on
    pub fn channel(&self) -> Channel {
        match self {
            Command::Tx => Channel::FullNodes,
            Command::GetTxFromPool => Channel::Mining,
            _ => Channel::General,
        }
    }
}

/// One-time connection greeting; how peers learn each other's channel
/// memberships and dial-back address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub height: u64,
    pub miner: bool,
    pub listen_addr: String,
}

/// Tip announcement: height, hash, and cumulative work so receivers can
/// pick a sync target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAnnounce {
    pub height: u64,
    pub hash: Hash256,
    pub work: BigUint,
}

/// Header request locator: the requester's own tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub height: u64,
    pub hash: Hash256,
}

/// What an inventory or fetch request refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Block,
    Tx,
}

impl InvKind {
    fn as_byte(self) -> u8 {
        match self {
            InvKind::Block => 1,
            InvKind::Tx => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            1 => Ok(InvKind::Block),
            2 => Ok(InvKind::Tx),
            other => Err(CodecError::Malformed(format!(
                "unknown inventory kind {}",
                other
            ))),
        }
    }
}

/// Hash inventory: announcement (`inv`) or fetch request (`getdata`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InvKind,
    pub hashes: Vec<Hash256>,
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Greeting),
    Tx(Transaction),
    Block(Box<Block>),
    BlockHeader(HeaderAnnounce),
    GetBlocks(Locator),
    GetData(Inventory),
    Inv(Inventory),
    GetTxFromPool { count: u32 },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Tx(_) => Command::Tx,
            Message::Block(_) => Command::Block,
            Message::BlockHeader(_) => Command::BlockHeader,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::GetData(_) => Command::GetData,
            Message::Inv(_) => Command::Inv,
            Message::GetTxFromPool { .. } => Command::GetTxFromPool,
        }
    }

    /// The channel this message travels on
    pub fn channel(&self) -> Channel {
        self.command().channel()
    }

    /// Identity used by gossip de-duplication
    pub fn gossip_id(&self) -> Hash256 {
        hash256(&self.encode())
    }

    /// Encode the full frame: padded command tag, length, payload
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();

        let mut frame = Vec::with_capacity(FRAME_HEADER_WIDTH + payload.len());
        let mut tag = [0u8; COMMAND_WIDTH];
        let name = self.command().as_str().as_bytes();
        tag[..name.len()].copy_from_slice(name);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(greeting) => {
                write_u64(&mut buf, greeting.height).unwrap();
                buf.push(greeting.miner as u8);
                write_var_bytes(&mut buf, greeting.listen_addr.as_bytes()).unwrap();
            }
            Message::Tx(tx) => buf = tx.serialize(),
            Message::Block(block) => buf = block.serialize(),
            Message::BlockHeader(header) => {
                write_u64(&mut buf, header.height).unwrap();
                write_hash(&mut buf, &header.hash).unwrap();
                write_biguint(&mut buf, &header.work).unwrap();
            }
            Message::GetBlocks(locator) => {
                write_u64(&mut buf, locator.height).unwrap();
                write_hash(&mut buf, &locator.hash).unwrap();
            }
            Message::GetData(inv) | Message::Inv(inv) => {
                buf.push(inv.kind.as_byte());
                write_u32(&mut buf, inv.hashes.len() as u32).unwrap();
                for hash in &inv.hashes {
                    write_hash(&mut buf, hash).unwrap();
                }
            }
            Message::GetTxFromPool { count } => {
                write_u32(&mut buf, *count).unwrap();
            }
        }
        buf
    }

    /// Decode a frame already split into tag and payload. An unknown
    /// command tag is an error the caller logs and drops.
    pub fn decode(tag: &str, payload: &[u8]) -> Result<Self, NetError> {
        let command = Command::from_str(tag).ok_or_else(|| NetError::UnknownCommand(tag.into()))?;
        let mut cursor = Cursor::new(payload);

        let message = match command {
            Command::Version => {
                let height = read_u64(&mut cursor)?;
                let mut flag = [0u8; 1];
                cursor
                    .read_exact(&mut flag)
                    .map_err(CodecError::from)?;
                let listen_addr = String::from_utf8(read_var_bytes(&mut cursor)?)
                    .map_err(|e| CodecError::Malformed(format!("bad listen address: {}", e)))?;
                Message::Version(Greeting {
                    height,
                    miner: flag[0] != 0,
                    listen_addr,
                })
            }
            Command::Tx => Message::Tx(Transaction::deserialize(payload).map_err(NetError::from)?),
            Command::Block => {
                Message::Block(Box::new(Block::deserialize(payload).map_err(NetError::from)?))
            }
            Command::BlockHeader => Message::BlockHeader(HeaderAnnounce {
                height: read_u64(&mut cursor)?,
                hash: read_hash(&mut cursor)?,
                work: read_biguint(&mut cursor)?,
            }),
            Command::GetBlocks => Message::GetBlocks(Locator {
                height: read_u64(&mut cursor)?,
                hash: read_hash(&mut cursor)?,
            }),
            Command::GetData | Command::Inv => {
                let mut kind = [0u8; 1];
                cursor
                    .read_exact(&mut kind)
                    .map_err(CodecError::from)?;
                let kind = InvKind::from_byte(kind[0])?;
                let count = read_u32(&mut cursor)? as usize;
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(read_hash(&mut cursor)?);
                }
                let inv = Inventory { kind, hashes };
                if command == Command::GetData {
                    Message::GetData(inv)
                } else {
                    Message::Inv(inv)
                }
            }
            Command::GetTxFromPool => Message::GetTxFromPool {
                count: read_u32(&mut cursor)?,
            },
        };
        Ok(message)
    }
}

/// Split a frame header into its command tag and payload length.
pub fn parse_frame_header(header: &[u8]) -> Result<(String, usize), NetError> {
    if header.len() < FRAME_HEADER_WIDTH {
        return Err(NetError::ShortFrame);
    }
    let tag_bytes = &header[..COMMAND_WIDTH];
    let end = tag_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(COMMAND_WIDTH);
    let tag = std::str::from_utf8(&tag_bytes[..end]).map_err(|_| NetError::BadCommandTag)?;
    if !tag.is_ascii() || tag.is_empty() {
        return Err(NetError::BadCommandTag);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[COMMAND_WIDTH..FRAME_HEADER_WIDTH]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(NetError::OversizedPayload(len));
    }
    Ok((tag.to_string(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TxInput, TxOutput};

    fn roundtrip(message: Message) -> Message {
        let frame = message.encode();
        let (tag, len) = parse_frame_header(&frame[..FRAME_HEADER_WIDTH]).unwrap();
        let payload = &frame[FRAME_HEADER_WIDTH..];
        assert_eq!(payload.len(), len);
        Message::decode(&tag, payload).unwrap()
    }

    #[test]
    fn test_command_tag_is_fixed_width() {
        let message = Message::GetTxFromPool { count: 3 };
        let frame = message.encode();
        assert_eq!(&frame[..13], b"gettxfrompool");
        assert!(frame[13..COMMAND_WIDTH].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_version_roundtrip() {
        let message = Message::Version(Greeting {
            height: 42,
            miner: true,
            listen_addr: "127.0.0.1:7333".into(),
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_header_announce_roundtrip() {
        let message = Message::BlockHeader(HeaderAnnounce {
            height: 9,
            hash: Hash256::new([3; 32]),
            work: BigUint::from(1u8) << 200usize,
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_inventory_roundtrip() {
        let inv = Inventory {
            kind: InvKind::Block,
            hashes: vec![Hash256::new([1; 32]), Hash256::new([2; 32])],
        };
        assert_eq!(
            roundtrip(Message::Inv(inv.clone())),
            Message::Inv(inv.clone())
        );
        assert_eq!(
            roundtrip(Message::GetData(inv.clone())),
            Message::GetData(inv)
        );
    }

    #[test]
    fn test_tx_roundtrip() {
        let mut tx = Transaction::new(
            vec![TxInput::new(Hash256::new([5; 32]), 0, vec![1, 2])],
            vec![TxOutput::new(900, vec![3, 4])],
        );
        tx.finalize(4);
        let message = Message::Tx(tx);
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_unknown_command_is_error() {
        let err = Message::decode("frobnicate", &[]).unwrap_err();
        assert!(matches!(err, NetError::UnknownCommand(_)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut header = vec![0u8; FRAME_HEADER_WIDTH];
        header[..2].copy_from_slice(b"tx");
        header[COMMAND_WIDTH..].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        assert!(matches!(
            parse_frame_header(&header),
            Err(NetError::OversizedPayload(_))
        ));
    }

    #[test]
    fn test_channel_mapping() {
        assert_eq!(Command::Tx.channel(), Channel::FullNodes);
        assert_eq!(Command::GetTxFromPool.channel(), Channel::Mining);
        assert_eq!(Command::Block.channel(), Channel::General);
        assert_eq!(Command::BlockHeader.channel(), Channel::General);
        assert_eq!(Command::Inv.channel(), Channel::General);
    }

    #[test]
    fn test_gossip_id_tracks_content() {
        let a = Message::GetTxFromPool { count: 1 };
        let b = Message::GetTxFromPool { count: 2 };
        assert_eq!(a.gossip_id(), a.gossip_id());
        assert_ne!(a.gossip_id(), b.gossip_id());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let message = Message::BlockHeader(HeaderAnnounce {
            height: 9,
            hash: Hash256::new([3; 32]),
            work: BigUint::from(7u8),
        });
        let frame = message.encode();
        let payload = &frame[FRAME_HEADER_WIDTH..frame.len() - 2];
        assert!(Message::decode("block_header", payload).is_err());
    }
}
