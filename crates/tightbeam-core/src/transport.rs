//! Datagram socket abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr, time::Duration};

/// Low-level datagram socket.
///
/// This trait allows various transports (UDP, loopback test harness) to be
/// plugged into the workers without coupling to a concrete implementation.
pub trait DatagramSocket: Send {
    /// Sends a single datagram.
    fn send_to(&self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Receives a single datagram, blocking for at most `timeout`.
    /// Returns `None` when the timeout elapsed with nothing to read.
    fn recv_timeout(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>>;

    /// Returns the local address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
