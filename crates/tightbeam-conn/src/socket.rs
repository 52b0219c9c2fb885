//! UDP socket setup.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use socket2::{Domain, Protocol, Socket as Socket2, Type};

use tightbeam_core::{config::Config, transport::DatagramSocket};

/// `DatagramSocket` over a real UDP socket with a bounded-timeout
/// receive.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds `addr`, applying the socket options from `config`. IPv6
    /// binds are dual-stack when configured.
    pub fn bind(addr: SocketAddr, config: &Config) -> io::Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket2 = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() && config.dual_stack {
            socket2.set_only_v6(false)?;
        }
        if let Some(size) = config.socket_recv_buffer_size {
            socket2.set_recv_buffer_size(size)?;
        }
        if let Some(size) = config.socket_send_buffer_size {
            socket2.set_send_buffer_size(size)?;
        }
        if let Some(ttl) = config.socket_ttl {
            socket2.set_ttl(ttl)?;
        }
        socket2.bind(&addr.into())?;
        let socket: UdpSocket = socket2.into();
        Ok(Self { socket })
    }

    /// Binds an ephemeral local port in the same address family as
    /// `remote`, for the client side of a connection.
    pub fn bind_ephemeral(remote: SocketAddr, config: &Config) -> io::Result<Self> {
        let local: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().expect("static address")
        } else {
            "0.0.0.0:0".parse().expect("static address")
        };
        Self::bind(local, config)
    }
}

impl DatagramSocket for UdpTransport {
    fn send_to(&self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn recv_timeout(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        // A zero timeout would put the socket in blocking mode.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv_from(buffer) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
