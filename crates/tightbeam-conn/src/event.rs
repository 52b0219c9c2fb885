use std::net::SocketAddr;

use tightbeam_core::SessionId;

/// Events pushed through the event queue to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A complete payload arrived from a peer.
    DataReceived {
        /// Peer the payload came from.
        peer_id: SessionId,
        /// The payload, reassembled if it was split.
        data: Vec<u8>,
    },
    /// A new peer was registered.
    PeerAdded {
        /// Id the peer is registered under.
        peer_id: SessionId,
        /// The peer's address.
        address: SocketAddr,
    },
    /// A peer was removed.
    PeerRemoved {
        /// Id the peer was registered under.
        peer_id: SessionId,
        /// True when removal was caused by inactivity rather than an
        /// orderly disconnect.
        is_timeout: bool,
        /// The peer's address.
        address: SocketAddr,
    },
    /// The UDP socket could not be bound; the connection never started.
    BindFailed,
}

impl ConnectionEvent {
    /// Short label for log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::DataReceived { .. } => "data_received",
            Self::PeerAdded { .. } => "peer_added",
            Self::PeerRemoved { .. } => "peer_removed",
            Self::BindFailed => "bind_failed",
        }
    }
}

/// Callbacks into the host application, invoked from the worker that
/// observes the transition.
pub trait PeerHandler: Send + Sync {
    /// A peer finished registering.
    fn on_peer_connected(&self, peer_id: SessionId);
    /// A peer was removed, by timeout or by an orderly disconnect.
    fn on_peer_disconnected(&self, peer_id: SessionId, is_timeout: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_labels() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(
            ConnectionEvent::DataReceived { peer_id: 2, data: vec![] }.describe(),
            "data_received"
        );
        assert_eq!(
            ConnectionEvent::PeerAdded { peer_id: 2, address: addr }.describe(),
            "peer_added"
        );
        assert_eq!(
            ConnectionEvent::PeerRemoved { peer_id: 2, is_timeout: true, address: addr }
                .describe(),
            "peer_removed"
        );
        assert_eq!(ConnectionEvent::BindFailed.describe(), "bind_failed");
    }
}
