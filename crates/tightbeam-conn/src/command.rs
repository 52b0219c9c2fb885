use std::net::SocketAddr;

use tightbeam_core::{SeqNum, SessionId};

/// A command from the user API (or the receive worker) to the send
/// worker.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Create the server-side peer entry for `address` and start the
    /// handshake.
    Connect {
        /// Remote address to connect to.
        address: SocketAddr,
    },
    /// Shut the connection down: drain, notify peers, stop workers.
    Disconnect,
    /// Disconnect one peer after its outgoing queues drain.
    DisconnectPeer {
        /// Peer to disconnect.
        peer_id: SessionId,
    },
    /// Queue a payload for one peer.
    Send {
        /// Destination peer.
        peer_id: SessionId,
        /// Channel to send on.
        channel: u8,
        /// User payload.
        payload: Vec<u8>,
        /// Whether delivery must be guaranteed and ordered.
        reliable: bool,
    },
    /// Queue a payload for every connected peer.
    SendToAll {
        /// Channel to send on.
        channel: u8,
        /// User payload.
        payload: Vec<u8>,
        /// Whether delivery must be guaranteed and ordered.
        reliable: bool,
    },
    /// Acknowledge a received reliable seqnum. Enqueued by the receive
    /// worker; transmitted ahead of queued data.
    Ack {
        /// Peer the reliable packet came from.
        peer_id: SessionId,
        /// Channel the reliable packet arrived on.
        channel: u8,
        /// Seqnum to acknowledge.
        seqnum: SeqNum,
    },
    /// Send the reliable SET_PEER_ID frame completing a new peer's
    /// handshake.
    CreatePeer {
        /// The freshly allocated peer.
        peer_id: SessionId,
    },
}

impl ConnectionCommand {
    /// Command to connect to a server.
    pub fn connect(address: SocketAddr) -> Self {
        Self::Connect { address }
    }

    /// Command to shut the connection down.
    pub fn disconnect() -> Self {
        Self::Disconnect
    }

    /// Command to disconnect one peer.
    pub fn disconnect_peer(peer_id: SessionId) -> Self {
        Self::DisconnectPeer { peer_id }
    }

    /// Command to send a payload to one peer.
    pub fn send(peer_id: SessionId, channel: u8, payload: Vec<u8>, reliable: bool) -> Self {
        Self::Send { peer_id, channel, payload, reliable }
    }

    /// Command to send a payload to every connected peer.
    pub fn send_to_all(channel: u8, payload: Vec<u8>, reliable: bool) -> Self {
        Self::SendToAll { channel, payload, reliable }
    }

    /// Command to acknowledge a reliable seqnum.
    pub fn ack(peer_id: SessionId, channel: u8, seqnum: SeqNum) -> Self {
        Self::Ack { peer_id, channel, seqnum }
    }

    /// Command to complete a new peer's handshake.
    pub fn create_peer(peer_id: SessionId) -> Self {
        Self::CreatePeer { peer_id }
    }
}
