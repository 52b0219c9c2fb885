//! The send worker thread.
//!
//! Drains the command queue, frames payloads into datagrams (splitting
//! and reliable-wrapping as needed), admits reliable packets into the
//! window, retransmits on timeout, pings idle peers and detects peer
//! timeouts.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, info, trace, warn};

use tightbeam_core::{
    constants::{BASE_HEADER_SIZE, CHANNEL_COUNT, PEER_ID_SERVER, RELIABLE_HEADER_SIZE},
    SessionId,
};
use tightbeam_peer::{Channel, Peer};
use tightbeam_protocol::framing::{
    make_ack, make_auto_split, make_disco, make_packet, make_ping, make_reliable,
    make_set_peer_id, BufferedPacket,
};

use crate::{
    command::ConnectionCommand,
    event::ConnectionEvent,
    shared::Shared,
    time::calc_dtime,
};

/// Upper bound on one command-queue wait so timers are serviced even
/// when no commands arrive.
const WAKE_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct SendWorker {
    shared: Arc<Shared>,
    command_rx: Receiver<ConnectionCommand>,
}

impl SendWorker {
    pub fn new(shared: Arc<Shared>, command_rx: Receiver<ConnectionCommand>) -> Self {
        Self { shared, command_rx }
    }

    pub fn run(self) {
        let mut last_time = self.shared.now_ms();
        loop {
            if self.shared.is_shutdown() {
                break;
            }

            match self.command_rx.recv_timeout(WAKE_INTERVAL) {
                Ok(command) => {
                    self.handle_command(command);
                    for _ in 1..self.shared.config.max_commands_per_iteration {
                        match self.command_rx.try_recv() {
                            Ok(command) => self.handle_command(command),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => {
                                self.shared.request_shutdown();
                                break;
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // The façade is gone; nothing can reach us anymore.
                    self.shared.request_shutdown();
                    break;
                }
            }
            if self.shared.is_shutdown() {
                break;
            }

            let now = self.shared.now_ms();
            let dtime = calc_dtime(last_time, now);
            last_time = now;

            self.run_timeouts(dtime, now);
            self.run_queues(now);
        }
        debug!("send worker stopped");
    }

    fn handle_command(&self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect { address } => self.connect(address),
            ConnectionCommand::Disconnect => self.disconnect_all(),
            ConnectionCommand::DisconnectPeer { peer_id } => {
                if let Some(peer) = self.shared.get_peer(peer_id) {
                    peer.mark_pending_disconnect();
                }
            }
            ConnectionCommand::Send { peer_id, channel, payload, reliable } => {
                self.handle_send(peer_id, channel, payload, reliable)
            }
            ConnectionCommand::SendToAll { channel, payload, reliable } => {
                for peer_id in self.shared.peer_ids() {
                    self.handle_send(peer_id, channel, payload.clone(), reliable);
                }
            }
            ConnectionCommand::Ack { peer_id, channel, seqnum } => {
                // Acks bypass the queues; stalling them stalls the
                // remote's whole window.
                if let Some(peer) = self.shared.get_peer(peer_id) {
                    let frame = make_ack(seqnum);
                    let pkt =
                        make_packet(peer.address, &frame, self.shared.own_peer_id(), channel);
                    self.shared.send_raw(&pkt.address, &pkt.data);
                    if let Some(chan) = peer.channel(channel) {
                        chan.update_bytes_sent(pkt.len() as u32);
                    }
                }
            }
            ConnectionCommand::CreatePeer { peer_id } => {
                if let Some(peer) = self.shared.get_peer(peer_id) {
                    let frame = make_set_peer_id(peer_id);
                    if !self.queue_reliable_frame(&peer, 0, &frame) {
                        warn!(peer_id, "could not queue SET_PEER_ID frame");
                    }
                }
            }
        }
    }

    /// Client side: register the server peer and start the handshake.
    fn connect(&self, address: std::net::SocketAddr) {
        if self.shared.get_peer(PEER_ID_SERVER).is_some() {
            warn!("connect requested but a server peer already exists");
            return;
        }
        info!(%address, "connecting");
        let peer = Arc::new(Peer::new(PEER_ID_SERVER, address, &self.shared.config));
        self.shared.insert_peer(Arc::clone(&peer));
        self.shared
            .post_event(ConnectionEvent::PeerAdded { peer_id: PEER_ID_SERVER, address });
        if let Some(handler) = &self.shared.handler {
            handler.on_peer_connected(PEER_ID_SERVER);
        }
        // A reliable ping forces the server to allocate a session id and
        // gives us an RTT probe; the SET_PEER_ID reply completes the
        // handshake.
        if !self.queue_reliable_frame(&peer, 0, &make_ping()) {
            warn!("could not queue the handshake ping");
        }
    }

    /// Shutdown: drain pending acks, notify every peer, stop.
    fn disconnect_all(&self) {
        while let Ok(command) = self.command_rx.try_recv() {
            if let ConnectionCommand::Ack { .. } = command {
                self.handle_command(command);
            }
        }
        for peer in self.shared.peers_snapshot() {
            self.send_disco(&peer);
        }
        self.shared.clear_peers();
        self.shared.request_shutdown();
        info!("connection shut down");
    }

    fn send_disco(&self, peer: &Peer) {
        let pkt = make_packet(peer.address, &make_disco(), self.shared.own_peer_id(), 0);
        self.shared.send_raw(&pkt.address, &pkt.data);
    }

    fn handle_send(&self, peer_id: SessionId, channel: u8, payload: Vec<u8>, reliable: bool) {
        if channel >= CHANNEL_COUNT {
            warn!(channel, "dropping send on invalid channel");
            return;
        }
        if payload.is_empty() {
            warn!(peer_id, "dropping empty payload");
            return;
        }
        let Some(peer) = self.shared.get_peer(peer_id) else {
            warn!(peer_id, "dropping send to unknown peer");
            return;
        };
        let chan = peer.channel(channel).expect("validated channel index");

        if reliable {
            chan.queued_commands
                .lock()
                .expect("queued commands poisoned")
                .push_back(payload);
            return;
        }

        // Unreliable payloads go straight to the wire, best effort.
        let mut split_seqnum = chan.split_seqnum();
        let frames =
            make_auto_split(&payload, self.shared.config.max_chunk_size(), &mut split_seqnum);
        chan.set_split_seqnum(split_seqnum);
        for frame in frames {
            let pkt = make_packet(peer.address, &frame, self.shared.own_peer_id(), channel);
            self.shared.send_raw(&pkt.address, &pkt.data);
            chan.update_bytes_sent(pkt.len() as u32);
        }
    }

    /// Frames a single packet reliable and queues it for transmission,
    /// consuming one seqnum. Used for pings and handshake frames.
    fn queue_reliable_frame(&self, peer: &Peer, channel: u8, frame: &[u8]) -> bool {
        let Some(chan) = peer.channel(channel) else { return false };
        let Some(seqnum) = chan.acquire_outgoing_seqnum() else {
            return false;
        };
        let framed = make_reliable(frame, seqnum);
        let pkt = make_packet(peer.address, &framed, self.shared.own_peer_id(), channel);
        chan.queued_reliables
            .lock()
            .expect("queued reliables poisoned")
            .push_back(pkt);
        true
    }

    /// Peer timeouts, retransmissions, pings and statistics windows.
    fn run_timeouts(&self, dtime: f32, _now_ms: u64) {
        let peer_timeout = self.shared.config.peer_timeout.as_secs_f32();
        let ping_interval = self.shared.config.ping_interval.as_secs_f32();

        for peer in self.shared.peers_snapshot() {
            if peer.is_pending_disconnect() && peer.outgoing_drained() {
                self.send_disco(&peer);
                self.shared.delete_peer(peer.id, false);
                continue;
            }
            if peer.check_timed_out(dtime, peer_timeout) {
                warn!(peer_id = peer.id, "peer timed out");
                self.shared.delete_peer(peer.id, true);
                continue;
            }

            let resend_timeout = peer.resend_timeout();
            for chan in peer.channels.iter() {
                chan.outgoing_reliables_sent.increment_timeouts(dtime);
                let timed_out = chan.outgoing_reliables_sent.timed_outs(
                    resend_timeout,
                    self.shared.config.max_resends_per_iteration,
                );
                if !timed_out.is_empty() {
                    chan.update_packet_loss_counter(timed_out.len() as u32);
                }
                for pkt in timed_out {
                    debug!(
                        peer_id = peer.id,
                        seqnum = pkt.seqnum().unwrap_or(0),
                        resend_count = pkt.resend_count,
                        "retransmitting reliable packet"
                    );
                    self.shared.send_raw(&pkt.address, &pkt.data);
                    chan.update_bytes_lost(pkt.len() as u32);
                }
                chan.update_timers(dtime);
            }

            if peer.ping_due(dtime, ping_interval) {
                trace!(peer_id = peer.id, "pinging peer");
                if !self.queue_reliable_frame(&peer, 0, &make_ping()) {
                    // Window full; the pending traffic doubles as
                    // liveness anyway.
                    trace!(peer_id = peer.id, "skipping ping, window full");
                }
            }
        }
    }

    /// Splits queued payloads into reliable packets and moves packets to
    /// the wire while the window admits them.
    fn run_queues(&self, now_ms: u64) {
        for peer in self.shared.peers_snapshot() {
            if peer.is_pending_deletion() {
                continue;
            }
            for (ch_index, chan) in peer.channels.iter().enumerate() {
                self.split_queued_commands(&peer, chan, ch_index as u8);
                self.transmit_queued_reliables(chan, now_ms);
            }
        }
    }

    fn split_queued_commands(&self, peer: &Peer, chan: &Channel, channel: u8) {
        loop {
            let Some(payload) = chan
                .queued_commands
                .lock()
                .expect("queued commands poisoned")
                .pop_front()
            else {
                break;
            };
            if !self.process_reliable_send(peer, chan, channel, &payload) {
                // Window full; keep the payload at the front for later.
                chan.queued_commands
                    .lock()
                    .expect("queued commands poisoned")
                    .push_front(payload);
                break;
            }
        }
    }

    /// Splits one payload and allocates seqnums for every resulting
    /// packet, or rolls back entirely when the window cannot take them.
    fn process_reliable_send(
        &self,
        peer: &Peer,
        chan: &Channel,
        channel: u8,
        payload: &[u8],
    ) -> bool {
        let chunksize_max = self
            .shared
            .config
            .max_packet_size
            .saturating_sub(BASE_HEADER_SIZE + RELIABLE_HEADER_SIZE);
        let mut split_seqnum = chan.split_seqnum();
        let frames = make_auto_split(payload, chunksize_max, &mut split_seqnum);

        let mut seqnums = Vec::with_capacity(frames.len());
        for _ in &frames {
            match chan.acquire_outgoing_seqnum() {
                Some(seqnum) => seqnums.push(seqnum),
                None => {
                    while let Some(seqnum) = seqnums.pop() {
                        chan.put_back_seqnum(seqnum);
                    }
                    return false;
                }
            }
        }
        chan.set_split_seqnum(split_seqnum);

        let mut queue = chan.queued_reliables.lock().expect("queued reliables poisoned");
        for (frame, seqnum) in frames.iter().zip(seqnums) {
            let framed = make_reliable(frame, seqnum);
            let pkt = make_packet(peer.address, &framed, self.shared.own_peer_id(), channel);
            queue.push_back(pkt);
        }
        true
    }

    fn transmit_queued_reliables(&self, chan: &Channel, now_ms: u64) {
        for _ in 0..self.shared.config.max_packets_per_iteration {
            let pkt = {
                let mut queue =
                    chan.queued_reliables.lock().expect("queued reliables poisoned");
                let Some(front) = queue.front() else { break };
                let Some(seqnum) = front.seqnum() else {
                    // Only reliable frames belong here.
                    debug_assert!(false, "unreliable packet in queued_reliables");
                    queue.pop_front();
                    continue;
                };
                let lowest = chan.outgoing_reliables_sent.first_seqnum().unwrap_or(seqnum);
                if seqnum.wrapping_sub(lowest) >= chan.window_size() {
                    break;
                }
                queue.pop_front().expect("front just peeked")
            };
            self.transmit_reliable(chan, pkt, now_ms);
        }
    }

    fn transmit_reliable(&self, chan: &Channel, mut pkt: BufferedPacket, now_ms: u64) {
        pkt.time = 0.0;
        pkt.absolute_send_time = now_ms;
        let next_expected = chan
            .outgoing_reliables_sent
            .first_seqnum()
            .or_else(|| pkt.seqnum())
            .unwrap_or_default();
        self.shared.send_raw(&pkt.address, &pkt.data);
        chan.update_bytes_sent(pkt.len() as u32);
        chan.outgoing_reliables_sent.insert(pkt, next_expected);
    }
}
