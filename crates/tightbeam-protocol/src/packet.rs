//! Datagram parsing.
//!
//! A packet is sent through a channel to a peer with a basic header:
//!
//! ```text
//! Header (7 bytes):
//! [0] u32 protocol_id
//! [4] u16 sender_peer_id
//! [6] u8 channel
//! ```
//!
//! `sender_peer_id` 0 is reserved for making new connections, 1 for the
//! server. Channel numbers have no intrinsic meaning; 0, 1 and 2 exist.
//!
//! After the base header a 1-byte packet type selects the framing:
//!
//! - `CONTROL` (0): protocol-internal, nothing is handed to the user.
//!   A `u8` control type follows: ACK (`u16` seqnum), SET_PEER_ID
//!   (`u16` new id), PING (empty), DISCO (empty).
//! - `ORIGINAL` (1): plain payload, handed to the user directly. Must be
//!   non-empty.
//! - `SPLIT` (2): `u16` seqnum, `u16` chunk_count, `u16` chunk_num, then
//!   chunk payload. A sequence of these forms one bigger piece of data.
//! - `RELIABLE` (3): `u16` seqnum, then another packet of any type except
//!   RELIABLE. Delivery is forced by ACKs, in sending order.
//!
//! All integers are big-endian.

use std::{fmt, io::Cursor, net::SocketAddr};

use byteorder::{BigEndian, ReadBytesExt};

use tightbeam_core::{
    constants::{CHANNEL_COUNT, PROTOCOL_ID},
    SeqNum, SessionId,
};

use crate::uuid::PacketUuid;

/// Raw wire value of the packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Protocol-internal control frame.
    Control = 0,
    /// Plain user payload.
    Original = 1,
    /// One chunk of a fragmented message.
    Split = 2,
    /// Reliable envelope around another packet.
    Reliable = 3,
}

impl PacketType {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Control),
            1 => Some(Self::Original),
            2 => Some(Self::Split),
            3 => Some(Self::Reliable),
            _ => None,
        }
    }
}

/// Raw wire value of the control type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Acknowledges one reliable seqnum.
    Ack = 0,
    /// Assigns the receiver its session id.
    SetPeerId = 1,
    /// Liveness probe; the ack of the reliable envelope is the reply.
    Ping = 2,
    /// Orderly disconnect notification.
    Disco = 3,
}

/// What a parsed datagram turned out to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Plain payload; contents go to the user.
    Original,
    /// Acknowledgment of a reliable seqnum.
    Ack {
        /// Seqnum being acknowledged.
        seqnum: SeqNum,
    },
    /// Server-assigned session id.
    SetPeerId {
        /// The id this end should adopt.
        new_peer_id: SessionId,
    },
    /// Liveness probe.
    Ping,
    /// Peer is disconnecting.
    Disco,
    /// One chunk of a fragmented message.
    Split {
        /// Split stream seqnum shared by all chunks of one message.
        seqnum: SeqNum,
        /// Total number of chunks.
        chunk_count: u16,
        /// Index of this chunk, `0..chunk_count`.
        chunk_num: u16,
    },
}

impl PacketKind {
    /// Short label for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Ack { .. } => "ack",
            Self::SetPeerId { .. } => "set_peer_id",
            Self::Ping => "ping",
            Self::Disco => "disco",
            Self::Split { .. } => "split",
        }
    }
}

/// Reliable envelope fields of a received datagram.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReliableHeader {
    /// 16-bit seqnum as seen on the wire.
    pub seqnum: SeqNum,
    /// The actual sequence number of this packet if the sequence number
    /// were a full 64 bits. Computed by the receive buffer on insert.
    pub full_seqnum: u64,
}

/// A fully parsed incoming datagram.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    /// Monotonic receive timestamp in milliseconds.
    pub received_time_ms: u64,
    /// Sender address.
    pub source_address: SocketAddr,
    /// Correlation id for log lines about this datagram.
    pub uuid: PacketUuid,
    /// Protocol magic from the base header.
    pub protocol_id: u32,
    /// Sender's session id from the base header.
    pub peer_id: SessionId,
    /// Channel from the base header.
    pub channel: u8,
    /// What the datagram carries (the inner type for reliable frames).
    pub kind: PacketKind,
    /// True when a RELIABLE envelope was present.
    pub is_reliable: bool,
    /// Reliable envelope fields; meaningful only when `is_reliable`.
    pub reliable: ReliableHeader,
    data: Vec<u8>,
    contents_offset: usize,
}

impl ReceivedPacket {
    /// Parses a raw datagram.
    ///
    /// Returns an error describing the first malformed field; the caller
    /// logs (except for wrong protocol ids, which are dropped silently)
    /// and discards the datagram.
    pub fn parse(
        data: Vec<u8>,
        source_address: SocketAddr,
        received_time_ms: u64,
    ) -> Result<Box<ReceivedPacket>, ParseError> {
        let uuid = PacketUuid::generate();
        let mut r = Cursor::new(data.as_slice());

        let protocol_id = read_u32(&mut r)?;
        if protocol_id != PROTOCOL_ID {
            return Err(ParseError::WrongProtocolId { got: protocol_id });
        }
        let peer_id = read_u16(&mut r)?;
        let channel = read_u8(&mut r)?;
        if channel >= CHANNEL_COUNT {
            return Err(ParseError::InvalidChannel { channel });
        }

        let mut raw_type = read_u8(&mut r)?;
        let mut is_reliable = false;
        let mut reliable = ReliableHeader::default();
        if PacketType::from_wire(raw_type) == Some(PacketType::Reliable) {
            is_reliable = true;
            reliable.seqnum = read_u16(&mut r)?;
            // After the reliable header comes another packet of a
            // different type.
            raw_type = read_u8(&mut r)?;
        }

        let kind = match PacketType::from_wire(raw_type) {
            Some(PacketType::Control) => {
                let control_type = read_u8(&mut r)?;
                match control_type {
                    x if x == ControlType::Ack as u8 => PacketKind::Ack { seqnum: read_u16(&mut r)? },
                    x if x == ControlType::SetPeerId as u8 => {
                        PacketKind::SetPeerId { new_peer_id: read_u16(&mut r)? }
                    }
                    x if x == ControlType::Ping as u8 => PacketKind::Ping,
                    x if x == ControlType::Disco as u8 => PacketKind::Disco,
                    value => return Err(ParseError::InvalidControlType { value }),
                }
            }
            Some(PacketType::Original) => PacketKind::Original,
            Some(PacketType::Split) => {
                let seqnum = read_u16(&mut r)?;
                let chunk_count = read_u16(&mut r)?;
                let chunk_num = read_u16(&mut r)?;
                if chunk_num >= chunk_count {
                    return Err(ParseError::InvalidChunkNumber { chunk_num, chunk_count });
                }
                PacketKind::Split { seqnum, chunk_count, chunk_num }
            }
            Some(PacketType::Reliable) => return Err(ParseError::NestedReliable),
            None => return Err(ParseError::InvalidPacketType { value: raw_type }),
        };

        let contents_offset = r.position() as usize;
        let contents_len = data.len() - contents_offset;
        let cannot_be_empty =
            matches!(kind, PacketKind::Original | PacketKind::Split { .. });
        if cannot_be_empty && contents_len == 0 {
            return Err(ParseError::EmptyContents);
        }

        Ok(Box::new(ReceivedPacket {
            received_time_ms,
            source_address,
            uuid,
            protocol_id,
            peer_id,
            channel,
            kind,
            is_reliable,
            reliable,
            data,
            contents_offset,
        }))
    }

    /// The part of the datagram not consumed by headers.
    pub fn contents(&self) -> &[u8] {
        &self.data[self.contents_offset..]
    }

    /// Takes the contents out of the packet, avoiding a copy when the
    /// payload is about to be handed upward.
    pub fn into_contents(mut self) -> Vec<u8> {
        self.data.split_off(self.contents_offset)
    }

    /// Total datagram size on the wire.
    pub fn raw_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for ReceivedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReceivedPacket[{}]", self.uuid)
    }
}

fn read_u8(r: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    let offset = r.position() as usize;
    r.read_u8().map_err(|_| ParseError::Truncated { offset })
}

fn read_u16(r: &mut Cursor<&[u8]>) -> Result<u16, ParseError> {
    let offset = r.position() as usize;
    r.read_u16::<BigEndian>().map_err(|_| ParseError::Truncated { offset })
}

fn read_u32(r: &mut Cursor<&[u8]>) -> Result<u32, ParseError> {
    let offset = r.position() as usize;
    r.read_u32::<BigEndian>().map_err(|_| ParseError::Truncated { offset })
}

/// Why a datagram failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram ended before the field starting at `offset`.
    Truncated {
        /// Byte offset of the field that ran past the end.
        offset: usize,
    },
    /// The protocol magic did not match; not our traffic.
    WrongProtocolId {
        /// Magic found on the wire.
        got: u32,
    },
    /// Channel byte outside `0..CHANNEL_COUNT`.
    InvalidChannel {
        /// Channel found on the wire.
        channel: u8,
    },
    /// Unknown packet type byte.
    InvalidPacketType {
        /// Type byte found on the wire.
        value: u8,
    },
    /// Unknown control type byte.
    InvalidControlType {
        /// Control byte found on the wire.
        value: u8,
    },
    /// A RELIABLE envelope inside a RELIABLE envelope.
    NestedReliable,
    /// ORIGINAL or SPLIT with zero-length contents.
    EmptyContents,
    /// `chunk_num >= chunk_count`.
    InvalidChunkNumber {
        /// Chunk index found on the wire.
        chunk_num: u16,
        /// Chunk count found on the wire.
        chunk_count: u16,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "unexpected end of datagram at offset {}", offset),
            Self::WrongProtocolId { got } => write!(f, "protocol_id {:08x} != {:08x}", got, PROTOCOL_ID),
            Self::InvalidChannel { channel } => write!(f, "invalid channel {}", channel),
            Self::InvalidPacketType { value } => write!(f, "invalid packet type {}", value),
            Self::InvalidControlType { value } => write!(f, "invalid control type {}", value),
            Self::NestedReliable => write!(f, "nested reliable packets"),
            Self::EmptyContents => write!(f, "empty contents"),
            Self::InvalidChunkNumber { chunk_num, chunk_count } => {
                write!(f, "chunk_num >= chunk_count: {} >= {}", chunk_num, chunk_count)
            }
        }
    }
}

impl std::error::Error for ParseError {}
