use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use tightbeam_core::{
    config::Config, constants::PEER_ID_SERVER, transport::DatagramSocket, SessionId,
};
use tightbeam_peer::{Peer, SplitTimeoutToken};
use tightbeam_util::TimeoutScheduler;

use crate::{
    command::ConnectionCommand,
    event::{ConnectionEvent, PeerHandler},
    time::Clock,
};

struct PeerRegistry {
    peers: HashMap<SessionId, Arc<Peer>>,
    /// Next id to hand to an unknown sender. Ids are never reused for
    /// the lifetime of the process; `None` once the space is exhausted.
    next_remote_peer_id: Option<SessionId>,
}

/// State shared between the two workers and the façade.
pub(crate) struct Shared {
    pub config: Config,
    pub socket: Box<dyn DatagramSocket + Sync>,
    pub clock: Arc<dyn Clock>,
    pub handler: Option<Arc<dyn PeerHandler>>,
    /// Lets the receive worker queue acks and handshake frames for the
    /// send worker.
    pub command_tx: Sender<ConnectionCommand>,
    event_tx: Sender<ConnectionEvent>,
    /// Scheduler for unreliable split reassembly expiry; processed by
    /// the receive worker.
    pub split_timeouts: TimeoutScheduler<SplitTimeoutToken>,
    registry: Mutex<PeerRegistry>,
    own_peer_id: AtomicU16,
    shutdown: AtomicBool,
}

impl Shared {
    pub fn new(
        config: Config,
        socket: Box<dyn DatagramSocket + Sync>,
        clock: Arc<dyn Clock>,
        handler: Option<Arc<dyn PeerHandler>>,
        command_tx: Sender<ConnectionCommand>,
        event_tx: Sender<ConnectionEvent>,
        own_peer_id: SessionId,
    ) -> Self {
        Self {
            config,
            socket,
            clock,
            handler,
            command_tx,
            event_tx,
            split_timeouts: TimeoutScheduler::new(),
            registry: Mutex::new(PeerRegistry {
                peers: HashMap::new(),
                next_remote_peer_id: Some(PEER_ID_SERVER + 1),
            }),
            own_peer_id: AtomicU16::new(own_peer_id),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn own_peer_id(&self) -> SessionId {
        self.own_peer_id.load(Ordering::Acquire)
    }

    pub fn set_own_peer_id(&self, id: SessionId) {
        self.own_peer_id.store(id, Ordering::Release);
    }

    pub fn is_server(&self) -> bool {
        self.own_peer_id() == PEER_ID_SERVER
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn post_event(&self, event: ConnectionEvent) {
        debug!(event = event.describe(), "posting connection event");
        // The receiver disappears when the façade is dropped mid-teardown.
        let _ = self.event_tx.send(event);
    }

    /// Hands out a peer reference. Condemned peers are not vended.
    pub fn get_peer(&self, peer_id: SessionId) -> Option<Arc<Peer>> {
        self.registry()
            .peers
            .get(&peer_id)
            .filter(|p| !p.is_pending_deletion())
            .cloned()
    }

    pub fn peer_by_address(&self, address: SocketAddr) -> Option<Arc<Peer>> {
        self.registry()
            .peers
            .values()
            .find(|p| p.address == address && !p.is_pending_deletion())
            .cloned()
    }

    pub fn peer_ids(&self) -> Vec<SessionId> {
        self.registry().peers.keys().copied().collect()
    }

    pub fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.registry().peers.values().cloned().collect()
    }

    /// Registers a peer created by the façade or the connect command.
    pub fn insert_peer(&self, peer: Arc<Peer>) {
        let previous = self.registry().peers.insert(peer.id, peer);
        debug_assert!(previous.is_none(), "peer id registered twice");
    }

    /// Creates and registers a peer for an unknown sender, allocating
    /// the next session id. Server side only.
    ///
    /// Ids are unique for the lifetime of the process, so a server that
    /// has cumulatively seen the whole id space rejects further
    /// connections rather than reusing an id.
    pub fn create_server_peer(&self, address: SocketAddr) -> Option<Arc<Peer>> {
        let mut registry = self.registry();
        let Some(id) = registry.next_remote_peer_id else {
            error!(%address, "session id space exhausted, rejecting new peer");
            return None;
        };
        registry.next_remote_peer_id = id.checked_add(1);
        let peer = Arc::new(Peer::new(id, address, &self.config));
        registry.peers.insert(id, Arc::clone(&peer));
        drop(registry);

        info!(peer_id = id, %address, "created peer for new remote");
        self.post_event(ConnectionEvent::PeerAdded { peer_id: id, address });
        if let Some(handler) = &self.handler {
            handler.on_peer_connected(id);
        }
        Some(peer)
    }

    /// Unregisters a peer, emitting the removal event and handler
    /// callback. The storage is freed once the last outstanding
    /// reference drops.
    pub fn delete_peer(&self, peer_id: SessionId, is_timeout: bool) -> bool {
        let Some(peer) = self.registry().peers.remove(&peer_id) else {
            return false;
        };
        peer.mark_pending_deletion();
        info!(peer_id, is_timeout, address = %peer.address, "removing peer");
        self.post_event(ConnectionEvent::PeerRemoved {
            peer_id,
            is_timeout,
            address: peer.address,
        });
        if let Some(handler) = &self.handler {
            handler.on_peer_disconnected(peer_id, is_timeout);
        }
        true
    }

    /// Removes every peer without events; used on shutdown after DISCO
    /// went out.
    pub fn clear_peers(&self) {
        let mut registry = self.registry();
        for peer in registry.peers.values() {
            peer.mark_pending_deletion();
        }
        registry.peers.clear();
    }

    pub fn send_raw(&self, address: &SocketAddr, data: &[u8]) {
        if let Err(e) = self.socket.send_to(address, data) {
            error!(%address, error = %e, "error sending a datagram");
        }
    }

    fn registry(&self) -> MutexGuard<'_, PeerRegistry> {
        self.registry.lock().expect("peer registry poisoned")
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("own_peer_id", &self.own_peer_id())
            .field("peers", &self.peer_ids())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
