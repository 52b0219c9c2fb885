//! The receive worker thread.
//!
//! Reads datagrams with a bounded timeout, parses them, resolves the
//! sending peer (allocating session ids server-side), runs the reliable
//! receive buffer and split reassembly, and publishes events. Also owns
//! the split-reassembly timeout scheduler.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::{debug, trace, warn};

use tightbeam_core::{
    constants::{PACKET_MAXSIZE, PEER_ID_INEXISTENT},
    SeqNum,
};
use tightbeam_peer::{Peer, SplitTimeoutToken};
use tightbeam_protocol::packet::{PacketKind, ParseError, ReceivedPacket};

use crate::{command::ConnectionCommand, event::ConnectionEvent, shared::Shared};

pub(crate) struct ReceiveWorker {
    shared: Arc<Shared>,
}

impl ReceiveWorker {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn run(self) {
        let mut buffer = vec![0u8; PACKET_MAXSIZE];
        loop {
            if self.shared.is_shutdown() {
                break;
            }
            let now = self.shared.now_ms();
            self.shared
                .split_timeouts
                .process(now, |token| self.handle_split_timeout(token));

            let timeout = self
                .shared
                .split_timeouts
                .next_timeout_ms(now)
                .map(Duration::from_millis)
                .unwrap_or(self.shared.config.receive_timeout)
                .min(self.shared.config.receive_timeout);

            match self.shared.socket.recv_timeout(&mut buffer, timeout) {
                Ok(Some((len, address))) => self.handle_datagram(&buffer[..len], address),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "error receiving a datagram");
                }
            }
        }
        debug!("receive worker stopped");
    }

    fn handle_split_timeout(&self, token: SplitTimeoutToken) {
        let Some(peer) = self.shared.get_peer(token.peer_id) else { return };
        let Some(chan) = peer.channel(token.channel) else { return };
        chan.incoming_splits
            .lock()
            .expect("split buffer poisoned")
            .handle_timeout(token.seqnum);
    }

    fn handle_datagram(&self, data: &[u8], address: SocketAddr) {
        let now = self.shared.now_ms();
        let rpkt = match ReceivedPacket::parse(data.to_vec(), address, now) {
            Ok(rpkt) => rpkt,
            Err(ParseError::WrongProtocolId { got }) => {
                // Not our traffic; no reply of any kind.
                trace!(%address, got, "ignoring datagram with foreign protocol id");
                return;
            }
            Err(e) => {
                warn!(%address, error = %e, "dropping malformed datagram");
                return;
            }
        };
        trace!(
            uuid = %rpkt.uuid,
            %address,
            peer_id = rpkt.peer_id,
            channel = rpkt.channel,
            kind = rpkt.kind.label(),
            reliable = rpkt.is_reliable,
            "datagram received"
        );

        let Some(peer) = self.resolve_peer(&rpkt, address) else {
            warn!(uuid = %rpkt.uuid, %address, peer_id = rpkt.peer_id, "datagram from unknown peer");
            return;
        };
        peer.reset_timeout();

        let channel = rpkt.channel;
        let chan = peer.channel(channel).expect("parser bounds the channel");
        chan.update_bytes_received(rpkt.raw_len() as u32);

        if rpkt.is_reliable {
            let peer_ref = &peer;
            let mut incoming = chan.incoming_reliables.lock().expect("receive buffer poisoned");
            incoming.insert(
                rpkt,
                |ack_for| self.send_ack(peer_ref, channel, ack_for.reliable.seqnum),
                |released| self.process_packet(peer_ref, released, now),
            );
        } else {
            self.process_packet(&peer, rpkt, now);
        }
    }

    /// Maps a datagram to its peer. Unknown senders are only accepted on
    /// the server side, and only while they still present peer id 0.
    fn resolve_peer(&self, rpkt: &ReceivedPacket, address: SocketAddr) -> Option<Arc<Peer>> {
        if rpkt.peer_id != PEER_ID_INEXISTENT {
            if let Some(peer) = self.shared.get_peer(rpkt.peer_id) {
                if peer.address == address {
                    return Some(peer);
                }
                warn!(
                    uuid = %rpkt.uuid,
                    peer_id = rpkt.peer_id,
                    %address,
                    expected = %peer.address,
                    "peer id presented from the wrong address"
                );
            }
        }
        // A client keeps sending peer id 0 until SET_PEER_ID arrives, so
        // fall back to the address.
        if let Some(peer) = self.shared.peer_by_address(address) {
            return Some(peer);
        }
        if self.shared.is_server() && rpkt.peer_id == PEER_ID_INEXISTENT {
            let peer = self.shared.create_server_peer(address)?;
            let _ = self
                .shared
                .command_tx
                .send(ConnectionCommand::create_peer(peer.id));
            return Some(peer);
        }
        None
    }

    fn send_ack(&self, peer: &Peer, channel: u8, seqnum: SeqNum) {
        let _ = self
            .shared
            .command_tx
            .send(ConnectionCommand::ack(peer.id, channel, seqnum));
    }

    /// Dispatches one in-order (or unreliable) packet. Returns false
    /// when the peer went away during processing, halting any further
    /// draining of its receive buffer.
    fn process_packet(&self, peer: &Arc<Peer>, rpkt: Box<ReceivedPacket>, now_ms: u64) -> bool {
        match rpkt.kind {
            PacketKind::Original => {
                self.shared.post_event(ConnectionEvent::DataReceived {
                    peer_id: peer.id,
                    data: rpkt.into_contents(),
                });
                true
            }
            PacketKind::Split { .. } => {
                let chan = peer.channel(rpkt.channel).expect("parser bounds the channel");
                let completed = chan
                    .incoming_splits
                    .lock()
                    .expect("split buffer poisoned")
                    .insert(rpkt, &self.shared.split_timeouts, peer.id, now_ms);
                if let Some(data) = completed {
                    self.shared
                        .post_event(ConnectionEvent::DataReceived { peer_id: peer.id, data });
                }
                true
            }
            PacketKind::Ack { seqnum } => {
                self.handle_ack(peer, rpkt.channel, seqnum, now_ms);
                true
            }
            PacketKind::SetPeerId { new_peer_id } => {
                self.handle_set_peer_id(new_peer_id);
                true
            }
            PacketKind::Ping => {
                // Nothing to do; the ack of the reliable envelope is the
                // reply.
                true
            }
            PacketKind::Disco => {
                debug!(peer_id = peer.id, "peer disconnected");
                self.shared.delete_peer(peer.id, false);
                false
            }
        }
    }

    fn handle_ack(&self, peer: &Peer, channel: u8, seqnum: SeqNum, now_ms: u64) {
        let Some(chan) = peer.channel(channel) else { return };
        match chan.outgoing_reliables_sent.pop_seqnum(seqnum) {
            Some(pkt) => {
                chan.update_packet_success_counter(1);
                // Retransmitted packets would bias the estimate: the ack
                // cannot be attributed to one transmission.
                if pkt.resend_count == 0 {
                    let rtt = now_ms.saturating_sub(pkt.absolute_send_time) as f32 / 1000.0;
                    peer.report_rtt(rtt);
                }
            }
            None => {
                trace!(peer_id = peer.id, channel, seqnum, "ack for unknown seqnum");
            }
        }
    }

    fn handle_set_peer_id(&self, new_peer_id: u16) {
        let own = self.shared.own_peer_id();
        if own == PEER_ID_INEXISTENT {
            debug!(peer_id = new_peer_id, "assigned session id");
            self.shared.set_own_peer_id(new_peer_id);
        } else if own != new_peer_id {
            warn!(current = own, proposed = new_peer_id, "refusing to change session id");
        }
    }
}
