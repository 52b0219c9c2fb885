#![warn(missing_docs)]

//! tightbeam-conn: the user-visible connection.
//!
//! A [`Connection`] owns a UDP socket and two worker threads. The send
//! worker drains the command queue, frames and transmits datagrams, and
//! handles retransmission, pings and peer timeouts. The receive worker
//! parses incoming datagrams, runs the reliability and reassembly
//! buffers, and publishes [`ConnectionEvent`]s to the user.

/// Commands from the user API to the send worker.
pub mod command;
/// Connection lifecycle and the public façade.
pub mod connection;
/// Events from the workers to the user.
pub mod event;
/// Shared per-connection state: peer registry, queues, flags.
mod shared;
/// UDP socket setup.
pub mod socket;
/// Monotonic clock abstraction.
pub mod time;

mod receive_worker;
mod send_worker;

pub use command::ConnectionCommand;
pub use connection::Connection;
pub use event::{ConnectionEvent, PeerHandler};
pub use socket::UdpTransport;
pub use time::{Clock, SystemClock};
