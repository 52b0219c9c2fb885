#![warn(missing_docs)]

//! tightbeam-protocol: packet framing and protocol logic.
//!
//! See [`packet`] for a description of the wire format.

/// Outbound framing: base headers, auto-split, reliable wrapping.
pub mod framing;
/// Datagram parsing and packet structures.
pub mod packet;
/// Receiving side of reliable delivery.
pub mod reliable_receive;
/// Sending side of reliable delivery: the unacked-packet store.
pub mod reliable_send;
/// Sequence number arithmetic.
pub mod seqnum;
/// Log-correlation ids for received datagrams.
pub mod uuid;

pub use framing::{make_auto_split, make_packet, make_reliable, BufferedPacket};
pub use packet::{ControlType, PacketKind, PacketType, ParseError, ReceivedPacket};
pub use reliable_receive::ReliableReceiveBuffer;
pub use reliable_send::ReliableSendBuffer;
pub use seqnum::{compute_full_seqnum, seqnum_in_window};
