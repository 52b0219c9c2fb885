//! Outbound framing: base headers, auto-split, reliable wrapping.

use std::net::SocketAddr;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use tightbeam_core::{
    constants::{
        BASE_HEADER_SIZE, ORIGINAL_HEADER_SIZE, PROTOCOL_ID, RELIABLE_HEADER_SIZE,
        SPLIT_HEADER_SIZE,
    },
    SeqNum, SessionId,
};

use crate::packet::PacketType;

/// An outbound datagram awaiting transmission or acknowledgment.
///
/// Holds the full wire bytes including every header, so retransmission is
/// a plain re-send of `data`.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    /// Complete datagram bytes.
    pub data: Vec<u8>,
    /// Destination address.
    pub address: SocketAddr,
    /// Seconds since this packet was last put on the wire.
    pub time: f32,
    /// Seconds since this packet was first buffered.
    pub totaltime: f32,
    /// Monotonic milliseconds of the first transmission; used for RTT.
    pub absolute_send_time: u64,
    /// How many times this packet has been retransmitted.
    pub resend_count: u32,
}

impl BufferedPacket {
    /// Creates a packet around ready-made wire bytes.
    pub fn new(data: Vec<u8>, address: SocketAddr) -> Self {
        Self { data, address, time: 0.0, totaltime: 0.0, absolute_send_time: 0, resend_count: 0 }
    }

    /// Reads the reliable seqnum back out of the framed bytes.
    /// Returns `None` when the packet is not a RELIABLE frame.
    pub fn seqnum(&self) -> Option<SeqNum> {
        let type_offset = BASE_HEADER_SIZE;
        if self.data.len() < BASE_HEADER_SIZE + RELIABLE_HEADER_SIZE {
            return None;
        }
        if self.data[type_offset] != PacketType::Reliable as u8 {
            return None;
        }
        Some(BigEndian::read_u16(&self.data[type_offset + 1..type_offset + 3]))
    }

    /// Total size on the wire.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the datagram carries no bytes (never the case for
    /// packets built through [`make_packet`]).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Adds the base header to framed packet bytes, producing a complete
/// datagram addressed to `address`.
pub fn make_packet(
    address: SocketAddr,
    framed: &[u8],
    sender_peer_id: SessionId,
    channel: u8,
) -> BufferedPacket {
    let mut data = Vec::with_capacity(BASE_HEADER_SIZE + framed.len());
    data.write_u32::<BigEndian>(PROTOCOL_ID).expect("vec write");
    data.write_u16::<BigEndian>(sender_peer_id).expect("vec write");
    data.push(channel);
    data.extend_from_slice(framed);
    BufferedPacket::new(data, address)
}

/// Frames a payload as a single ORIGINAL or, when it does not fit in
/// `chunksize_max`, as a sequence of SPLIT chunks sharing one split
/// seqnum. Increments `split_seqnum` if a split was made.
///
/// `chunksize_max` bounds each returned frame, excluding the base header
/// (and excluding the reliable header; callers shrink the bound when the
/// result will be wrapped reliable).
pub fn make_auto_split(
    payload: &[u8],
    chunksize_max: usize,
    split_seqnum: &mut SeqNum,
) -> Vec<Vec<u8>> {
    debug_assert!(!payload.is_empty());
    debug_assert!(chunksize_max > SPLIT_HEADER_SIZE);

    if payload.len() + ORIGINAL_HEADER_SIZE <= chunksize_max {
        let mut frame = Vec::with_capacity(ORIGINAL_HEADER_SIZE + payload.len());
        frame.push(PacketType::Original as u8);
        frame.extend_from_slice(payload);
        return vec![frame];
    }

    let chunk_payload = chunksize_max - SPLIT_HEADER_SIZE;
    let chunk_count = payload.len().div_ceil(chunk_payload);
    debug_assert!(chunk_count <= u16::MAX as usize);

    let mut frames = Vec::with_capacity(chunk_count);
    for (chunk_num, chunk) in payload.chunks(chunk_payload).enumerate() {
        let mut frame = Vec::with_capacity(SPLIT_HEADER_SIZE + chunk.len());
        frame.push(PacketType::Split as u8);
        frame.write_u16::<BigEndian>(*split_seqnum).expect("vec write");
        frame.write_u16::<BigEndian>(chunk_count as u16).expect("vec write");
        frame.write_u16::<BigEndian>(chunk_num as u16).expect("vec write");
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    *split_seqnum = split_seqnum.wrapping_add(1);
    frames
}

/// Prepends the RELIABLE header to framed packet bytes.
pub fn make_reliable(framed: &[u8], seqnum: SeqNum) -> Vec<u8> {
    let mut out = Vec::with_capacity(RELIABLE_HEADER_SIZE + framed.len());
    out.push(PacketType::Reliable as u8);
    out.write_u16::<BigEndian>(seqnum).expect("vec write");
    out.extend_from_slice(framed);
    out
}

/// Frames an ACK control packet for the given seqnum.
pub fn make_ack(seqnum: SeqNum) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push(PacketType::Control as u8);
    out.push(crate::packet::ControlType::Ack as u8);
    out.write_u16::<BigEndian>(seqnum).expect("vec write");
    out
}

/// Frames a SET_PEER_ID control packet.
pub fn make_set_peer_id(new_peer_id: SessionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push(PacketType::Control as u8);
    out.push(crate::packet::ControlType::SetPeerId as u8);
    out.write_u16::<BigEndian>(new_peer_id).expect("vec write");
    out
}

/// Frames a PING control packet.
pub fn make_ping() -> Vec<u8> {
    vec![PacketType::Control as u8, crate::packet::ControlType::Ping as u8]
}

/// Frames a DISCO control packet.
pub fn make_disco() -> Vec<u8> {
    vec![PacketType::Control as u8, crate::packet::ControlType::Disco as u8]
}
