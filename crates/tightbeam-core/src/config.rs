use std::{default::Default, time::Duration};

use crate::constants::BASE_HEADER_SIZE;

#[derive(Clone, Debug)]
/// Configuration options to tune protocol and worker behavior.
pub struct Config {
    /// Max outgoing datagram size in bytes, including all headers.
    /// Payloads that don't fit after framing are split.
    pub max_packet_size: usize,
    /// Max idle time before a peer is considered disconnected.
    pub peer_timeout: Duration,
    /// Interval between liveness pings when nothing else is flowing.
    pub ping_interval: Duration,
    /// Upper bound on a single blocking socket read; the receive worker
    /// re-checks timers at least this often.
    pub receive_timeout: Duration,
    /// Max queued commands the send worker dequeues per wakeup.
    pub max_commands_per_iteration: usize,
    /// Max reliable packets put on the wire per peer per wakeup.
    pub max_packets_per_iteration: usize,
    /// Max retransmissions per channel per wakeup.
    pub max_resends_per_iteration: usize,
    /// Floor for the dynamic retransmission timeout in seconds.
    pub resend_timeout_min: f32,
    /// Ceiling for the dynamic retransmission timeout in seconds.
    pub resend_timeout_max: f32,
    /// Multiplier applied to the smoothed RTT to derive the
    /// retransmission timeout.
    pub resend_timeout_factor: f32,
    /// Socket receive buffer size in bytes (None = system default).
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = system default).
    pub socket_send_buffer_size: Option<usize>,
    /// Time-to-live for outgoing packets (None = system default).
    pub socket_ttl: Option<u32>,
    /// When binding an IPv6 address, also accept IPv4-mapped traffic.
    pub dual_stack: bool,
}

impl Config {
    /// Largest payload that fits in a single non-split datagram on this
    /// configuration, before the reliable header is accounted for.
    pub fn max_chunk_size(&self) -> usize {
        self.max_packet_size.saturating_sub(BASE_HEADER_SIZE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: 1400,
            peer_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            receive_timeout: Duration::from_millis(50),
            max_commands_per_iteration: 64,
            max_packets_per_iteration: 128,
            max_resends_per_iteration: 32,
            resend_timeout_min: 0.1,
            resend_timeout_max: 3.0,
            resend_timeout_factor: 4.0,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            socket_ttl: None,
            dual_stack: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunk_bound() {
        let config = Config::default();
        assert_eq!(config.max_chunk_size(), 1400 - BASE_HEADER_SIZE);
    }

    #[test]
    fn test_chunk_bound_never_underflows() {
        let mut config = Config::default();
        config.max_packet_size = 3;
        assert_eq!(config.max_chunk_size(), 0);
    }
}
