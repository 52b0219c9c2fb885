#![warn(missing_docs)]

//! tightbeam-core: foundational types shared across all layers.
//!
//! This crate provides the minimal set of core utilities:
//! - Protocol constants (header sizes, reserved ids, window bounds)
//! - Configuration types
//! - Error handling
//! - The datagram socket abstraction
//!
//! Protocol logic lives in the specialized crates:
//! - `tightbeam-protocol`: wire codec, reliable send/receive buffers
//! - `tightbeam-peer`: per-peer channel and session state
//! - `tightbeam-conn`: connection façade and worker threads

/// Protocol constants shared across layers.
pub mod constants {
    /// Magic number at the start of every datagram. Mismatches are
    /// dropped without a reply.
    pub const PROTOCOL_ID: u32 = 0x54_42_4D_31;

    /// Base header: u32 protocol_id | u16 sender_peer_id | u8 channel.
    pub const BASE_HEADER_SIZE: usize = 7;
    /// ORIGINAL header: u8 type.
    pub const ORIGINAL_HEADER_SIZE: usize = 1;
    /// SPLIT header: u8 type | u16 seqnum | u16 chunk_count | u16 chunk_num.
    pub const SPLIT_HEADER_SIZE: usize = 7;
    /// RELIABLE header: u8 type | u16 seqnum.
    pub const RELIABLE_HEADER_SIZE: usize = 3;

    /// Number of independent channels per peer.
    pub const CHANNEL_COUNT: u8 = 3;

    /// Receive buffer size; the IPv6 minimum MTU is the theoretical
    /// reliable upper boundary of a UDP datagram on all IPv6-enabled
    /// infrastructure.
    pub const PACKET_MAXSIZE: usize = 1500;

    /// Initial sequence number for every counter. Close to the wrap point
    /// so that wrap-around is exercised early.
    pub const SEQNUM_INITIAL: u16 = 65500;
    /// Largest sequence number before wrapping.
    pub const SEQNUM_MAX: u16 = 65535;

    /// Maximum reliable window size, half the seqnum space. Going closer
    /// to 0xFFFF makes stale retransmissions indistinguishable from new
    /// data.
    pub const MAX_RELIABLE_WINDOW_SIZE: u16 = 0x8000;
    /// Starting reliable window size.
    pub const START_RELIABLE_WINDOW_SIZE: u16 = 0x400;
    /// Minimum reliable window size.
    pub const MIN_RELIABLE_WINDOW_SIZE: u16 = 0x40;

    /// Peer id of a not-yet-assigned peer; also what a connecting client
    /// sends until the server hands it a real id.
    pub const PEER_ID_INEXISTENT: u16 = 0;
    /// Peer id reserved for the server end of a connection.
    pub const PEER_ID_SERVER: u16 = 1;

    /// Inactivity timeout for unreliable split-packet reassembly.
    pub const SPLIT_TIMEOUT_MS: u64 = 30;
}

/// Configuration options.
pub mod config;
/// Error types and results.
pub mod error;
/// Datagram socket abstraction for pluggable I/O.
pub mod transport;

/// Session-local peer identifier carried in every datagram header.
pub type SessionId = u16;
/// 16-bit wrapping sequence number used on the wire.
pub type SeqNum = u16;
