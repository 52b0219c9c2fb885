#![warn(missing_docs)]

//! tightbeam-peer: per-peer protocol state.
//!
//! A peer owns three independent [`Channel`]s, each with its own seqnum
//! counters, reliable window, reliability buffers and rate statistics,
//! plus peer-wide liveness state: RTT tracking, the dynamic resend
//! timeout, the ping timer and the idle-timeout counter.

/// Per-channel state: counters, queues, window, rate statistics.
pub mod channel;
/// Peer state and lifecycle flags.
pub mod peer;
/// Round-trip-time and jitter tracking.
pub mod rtt;
/// Reassembly of split packets.
pub mod split_buffer;

pub use channel::{Channel, RateStat};
pub use peer::Peer;
pub use rtt::{RttEstimator, RttStat};
pub use split_buffer::{IncomingSplitBuffer, SplitTimeoutToken};
