//! Connection lifecycle and the public façade.

use std::{
    net::SocketAddr,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use tightbeam_core::{
    config::Config,
    constants::{CHANNEL_COUNT, PEER_ID_INEXISTENT, PEER_ID_SERVER},
    error::{ErrorKind, Result},
    transport::DatagramSocket,
    SessionId,
};
use tightbeam_peer::{RateStat, RttStat};

use crate::{
    command::ConnectionCommand,
    event::{ConnectionEvent, PeerHandler},
    receive_worker::ReceiveWorker,
    send_worker::SendWorker,
    shared::Shared,
    socket::UdpTransport,
    time::{Clock, SystemClock},
};

/// A reliable, channelized message transport endpoint over UDP.
///
/// Create with [`Connection::new`], then either [`serve`](Self::serve) a
/// bind address or [`connect`](Self::connect) to a server. Each started
/// connection runs two worker threads which stop on
/// [`disconnect`](Self::disconnect) (also called on drop).
pub struct Connection {
    config: Config,
    handler: Option<Arc<dyn PeerHandler>>,
    clock: Arc<dyn Clock>,
    command_tx: Sender<ConnectionCommand>,
    command_rx: Option<Receiver<ConnectionCommand>>,
    event_tx: Sender<ConnectionEvent>,
    event_rx: Receiver<ConnectionEvent>,
    shared: Option<Arc<Shared>>,
    send_thread: Option<JoinHandle<()>>,
    receive_thread: Option<JoinHandle<()>>,
}

impl Connection {
    /// Creates an idle connection with the given configuration.
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, None, Arc::new(SystemClock::new()))
    }

    /// Creates an idle connection that notifies `handler` about peer
    /// lifecycle transitions.
    pub fn with_handler(config: Config, handler: Arc<dyn PeerHandler>) -> Self {
        Self::with_clock(config, Some(handler), Arc::new(SystemClock::new()))
    }

    /// Creates an idle connection with a custom clock, for tests.
    pub fn with_clock(
        config: Config,
        handler: Option<Arc<dyn PeerHandler>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        Self {
            config,
            handler,
            clock,
            command_tx,
            command_rx: Some(command_rx),
            event_tx,
            event_rx,
            shared: None,
            send_thread: None,
            receive_thread: None,
        }
    }

    /// Binds `bind_addr` and starts accepting clients. The local end
    /// takes the reserved server session id.
    ///
    /// On bind failure a [`ConnectionEvent::BindFailed`] event is
    /// emitted and no workers start.
    pub fn serve(&mut self, bind_addr: SocketAddr) -> Result<()> {
        if self.shared.is_some() {
            return Err(ErrorKind::AlreadyStarted);
        }
        match UdpTransport::bind(bind_addr, &self.config) {
            Ok(socket) => {
                info!(%bind_addr, "serving");
                self.start(Box::new(socket), PEER_ID_SERVER);
                Ok(())
            }
            Err(source) => {
                error!(%bind_addr, error = %source, "bind failed");
                let _ = self.event_tx.send(ConnectionEvent::BindFailed);
                Err(ErrorKind::Bind { addr: bind_addr, source })
            }
        }
    }

    /// Binds an ephemeral local port and connects to a server. The
    /// session id is assigned by the server during the handshake.
    pub fn connect(&mut self, address: SocketAddr) -> Result<()> {
        if self.shared.is_some() {
            return Err(ErrorKind::AlreadyStarted);
        }
        match UdpTransport::bind_ephemeral(address, &self.config) {
            Ok(socket) => {
                self.start(Box::new(socket), PEER_ID_INEXISTENT);
                self.put_command(ConnectionCommand::connect(address))
            }
            Err(source) => {
                error!(%address, error = %source, "bind failed");
                let _ = self.event_tx.send(ConnectionEvent::BindFailed);
                Err(ErrorKind::Bind { addr: address, source })
            }
        }
    }

    fn start(&mut self, socket: Box<dyn DatagramSocket + Sync>, own_peer_id: SessionId) {
        let shared = Arc::new(Shared::new(
            self.config.clone(),
            socket,
            Arc::clone(&self.clock),
            self.handler.clone(),
            self.command_tx.clone(),
            self.event_tx.clone(),
            own_peer_id,
        ));
        let command_rx = self.command_rx.take().expect("start called once");

        let send_worker = SendWorker::new(Arc::clone(&shared), command_rx);
        let receive_worker = ReceiveWorker::new(Arc::clone(&shared));
        self.send_thread = Some(
            std::thread::Builder::new()
                .name("tightbeam-send".into())
                .spawn(move || send_worker.run())
                .expect("spawning the send worker"),
        );
        self.receive_thread = Some(
            std::thread::Builder::new()
                .name("tightbeam-recv".into())
                .spawn(move || receive_worker.run())
                .expect("spawning the receive worker"),
        );
        self.shared = Some(shared);
    }

    /// Shuts the connection down: notifies peers, stops and joins both
    /// workers. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(shared) = &self.shared {
            let _ = self.command_tx.send(ConnectionCommand::disconnect());
            if let Some(handle) = self.send_thread.take() {
                let _ = handle.join();
            }
            // The send worker sets the shutdown flag; the receive worker
            // notices within its bounded read timeout.
            shared.request_shutdown();
            if let Some(handle) = self.receive_thread.take() {
                let _ = handle.join();
            }
        }
    }

    /// Queues a payload to a peer. Reliable payloads are delivered
    /// exactly once, in order within the channel; unreliable payloads
    /// are best effort.
    pub fn send(
        &self,
        peer_id: SessionId,
        channel: u8,
        payload: Vec<u8>,
        reliable: bool,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(ErrorKind::InvalidChannel(channel));
        }
        self.put_command(ConnectionCommand::send(peer_id, channel, payload, reliable))
    }

    /// Queues a payload to every connected peer.
    pub fn send_to_all(&self, channel: u8, payload: Vec<u8>, reliable: bool) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(ErrorKind::InvalidChannel(channel));
        }
        self.put_command(ConnectionCommand::send_to_all(channel, payload, reliable))
    }

    /// Disconnects one peer after its outgoing queues drain.
    pub fn disconnect_peer(&self, peer_id: SessionId) -> Result<()> {
        self.put_command(ConnectionCommand::disconnect_peer(peer_id))
    }

    /// Blocks up to `timeout` for the next event.
    pub fn wait_event(&self, timeout: Duration) -> Option<ConnectionEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Returns the next event if one is already queued.
    pub fn try_receive(&self) -> Option<ConnectionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// This end's session id: 1 when serving, 0 until the server assigns
    /// an id when connecting.
    pub fn peer_id(&self) -> SessionId {
        self.shared.as_ref().map(|s| s.own_peer_id()).unwrap_or(PEER_ID_INEXISTENT)
    }

    /// True once a session id has been established (always true while
    /// serving).
    pub fn is_connected(&self) -> bool {
        self.peer_id() != PEER_ID_INEXISTENT
    }

    /// The address of a connected peer.
    pub fn peer_address(&self, peer_id: SessionId) -> Result<SocketAddr> {
        let shared = self.shared.as_ref().ok_or(ErrorKind::NotConnected)?;
        shared
            .get_peer(peer_id)
            .map(|p| p.address)
            .ok_or(ErrorKind::UnknownPeer(peer_id))
    }

    /// Reads one RTT statistic of a peer; `None` before any sample.
    pub fn peer_stat(&self, peer_id: SessionId, kind: RttStat) -> Result<Option<f32>> {
        let shared = self.shared.as_ref().ok_or(ErrorKind::NotConnected)?;
        let peer = shared.get_peer(peer_id).ok_or(ErrorKind::UnknownPeer(peer_id))?;
        Ok(peer.rtt_stat(kind))
    }

    /// Sums one rate statistic across every peer and channel.
    pub fn local_stat(&self, kind: RateStat) -> f32 {
        match &self.shared {
            Some(shared) => shared.peers_snapshot().iter().map(|p| p.rate_stat(kind)).sum(),
            None => 0.0,
        }
    }

    /// The bound local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let shared = self.shared.as_ref().ok_or(ErrorKind::NotConnected)?;
        Ok(shared.socket.local_addr()?)
    }

    fn put_command(&self, command: ConnectionCommand) -> Result<()> {
        if self.shared.is_none() {
            return Err(ErrorKind::NotConnected);
        }
        self.command_tx
            .send(command)
            .map_err(|_| ErrorKind::ShuttingDown)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id())
            .field("started", &self.shared.is_some())
            .finish()
    }
}
