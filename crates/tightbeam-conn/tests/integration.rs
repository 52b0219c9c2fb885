//! End-to-end tests running two real connections over loopback UDP.

use std::{
    net::UdpSocket,
    time::{Duration, Instant},
};

use tightbeam_conn::{Connection, ConnectionEvent};
use tightbeam_core::{config::Config, constants::PEER_ID_SERVER, SessionId};
use tightbeam_peer::RttStat;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

fn server_client_pair(config: Config) -> (Connection, Connection) {
    let mut server = Connection::new(config.clone());
    server.serve("127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client = Connection::new(config);
    client.connect(server_addr).unwrap();
    (server, client)
}

fn wait_connected(client: &Connection) {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    while !client.is_connected() {
        assert!(Instant::now() < deadline, "client never received its session id");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Waits for the first event matching `pred`, discarding others.
fn wait_for<F>(conn: &Connection, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        if let Some(event) = conn.wait_event(remaining) {
            if pred(&event) {
                return event;
            }
        }
    }
}

fn wait_for_data(conn: &Connection) -> (SessionId, Vec<u8>) {
    match wait_for(conn, |e| matches!(e, ConnectionEvent::DataReceived { .. })) {
        ConnectionEvent::DataReceived { peer_id, data } => (peer_id, data),
        _ => unreachable!(),
    }
}

#[test]
fn test_client_server_handshake() {
    let (server, client) = server_client_pair(Config::default());

    // The client registers the server peer immediately.
    let event = wait_for(&client, |e| matches!(e, ConnectionEvent::PeerAdded { .. }));
    assert_eq!(
        event,
        ConnectionEvent::PeerAdded {
            peer_id: PEER_ID_SERVER,
            address: server.local_addr().unwrap()
        }
    );

    // The server allocates a session id starting at 2.
    let event = wait_for(&server, |e| matches!(e, ConnectionEvent::PeerAdded { .. }));
    let ConnectionEvent::PeerAdded { peer_id, .. } = event else { unreachable!() };
    assert_eq!(peer_id, 2);

    // SET_PEER_ID reaches the client.
    wait_connected(&client);
    assert_eq!(client.peer_id(), 2);
    assert_eq!(server.peer_id(), PEER_ID_SERVER);
}

#[test]
fn test_reliable_roundtrip_both_directions() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);
    let client_id = client.peer_id();

    server.send(client_id, 0, b"abc".to_vec(), true).unwrap();
    assert_eq!(wait_for_data(&client), (PEER_ID_SERVER, b"abc".to_vec()));

    client.send(PEER_ID_SERVER, 1, b"def".to_vec(), true).unwrap();
    assert_eq!(wait_for_data(&server), (client_id, b"def".to_vec()));
}

#[test]
fn test_reliable_split_payload_roundtrip() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);

    // Far beyond one datagram; travels as a reliable split.
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    client.send(PEER_ID_SERVER, 2, payload.clone(), true).unwrap();

    let (from, data) = wait_for_data(&server);
    assert_eq!(from, client.peer_id());
    assert_eq!(data, payload);
}

#[test]
fn test_unreliable_payload_roundtrip() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);

    client.send(PEER_ID_SERVER, 0, b"best effort".to_vec(), false).unwrap();
    let (_, data) = wait_for_data(&server);
    assert_eq!(data, b"best effort".to_vec());
}

#[test]
fn test_reliable_stream_is_ordered() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);

    // Enough messages to push the outgoing seqnum through the 16-bit
    // wrap (counters start at 65500).
    let count = 100u32;
    for i in 0..count {
        client
            .send(PEER_ID_SERVER, 0, i.to_be_bytes().to_vec(), true)
            .unwrap();
    }
    for expected in 0..count {
        let (_, data) = wait_for_data(&server);
        assert_eq!(data, expected.to_be_bytes().to_vec());
    }
}

#[test]
fn test_send_to_all_reaches_every_client() {
    let mut server = Connection::new(Config::default());
    server.serve("127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client_a = Connection::new(Config::default());
    client_a.connect(server_addr).unwrap();
    wait_connected(&client_a);
    let mut client_b = Connection::new(Config::default());
    client_b.connect(server_addr).unwrap();
    wait_connected(&client_b);

    server.send_to_all(0, b"fanout".to_vec(), true).unwrap();
    assert_eq!(wait_for_data(&client_a).1, b"fanout".to_vec());
    assert_eq!(wait_for_data(&client_b).1, b"fanout".to_vec());
}

#[test]
fn test_client_disconnect_notifies_server() {
    let (server, mut client) = server_client_pair(Config::default());
    wait_connected(&client);
    let client_id = client.peer_id();

    client.disconnect();

    let event = wait_for(&server, |e| matches!(e, ConnectionEvent::PeerRemoved { .. }));
    let ConnectionEvent::PeerRemoved { peer_id, is_timeout, .. } = event else { unreachable!() };
    assert_eq!(peer_id, client_id);
    assert!(!is_timeout, "an orderly disconnect is not a timeout");
}

#[test]
fn test_server_can_disconnect_one_peer() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);
    let client_id = client.peer_id();

    server.disconnect_peer(client_id).unwrap();

    // The server drops its side once the queues drain...
    let event = wait_for(&server, |e| matches!(e, ConnectionEvent::PeerRemoved { .. }));
    let ConnectionEvent::PeerRemoved { peer_id, is_timeout, .. } = event else { unreachable!() };
    assert_eq!(peer_id, client_id);
    assert!(!is_timeout);

    // ...and the DISCO tears down the client side too.
    let event = wait_for(&client, |e| matches!(e, ConnectionEvent::PeerRemoved { .. }));
    let ConnectionEvent::PeerRemoved { peer_id, is_timeout, .. } = event else { unreachable!() };
    assert_eq!(peer_id, PEER_ID_SERVER);
    assert!(!is_timeout);
}

#[test]
fn test_silent_peer_times_out() {
    let mut config = Config::default();
    config.peer_timeout = Duration::from_millis(300);
    config.ping_interval = Duration::from_millis(100);

    let mut server = Connection::new(config);
    server.serve("127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server.local_addr().unwrap();

    // A bare socket that introduces itself and then goes silent.
    let mute = UdpSocket::bind("127.0.0.1:0").unwrap();
    let hello = tightbeam_protocol::make_packet(
        server_addr,
        &tightbeam_protocol::make_reliable(&tightbeam_protocol::framing::make_ping(), 65500),
        0,
        0,
    );
    mute.send_to(&hello.data, server_addr).unwrap();

    let event = wait_for(&server, |e| matches!(e, ConnectionEvent::PeerAdded { .. }));
    let ConnectionEvent::PeerAdded { peer_id, .. } = event else { unreachable!() };

    let event = wait_for(&server, |e| matches!(e, ConnectionEvent::PeerRemoved { .. }));
    let ConnectionEvent::PeerRemoved { peer_id: removed, is_timeout, .. } = event else {
        unreachable!()
    };
    assert_eq!(removed, peer_id);
    assert!(is_timeout, "silence must be reported as a timeout");
}

#[test]
fn test_rtt_stats_populate_after_handshake() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);
    let client_id = client.peer_id();

    // The handshake ping/SET_PEER_ID acks already carry RTT samples;
    // allow a moment for the acks to land.
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let client_rtt = client.peer_stat(PEER_ID_SERVER, RttStat::AvgRtt).unwrap();
        let server_rtt = server.peer_stat(client_id, RttStat::AvgRtt).unwrap();
        if let (Some(c), Some(s)) = (client_rtt, server_rtt) {
            assert!(c >= 0.0 && c < 1.0, "loopback RTT out of range: {}", c);
            assert!(s >= 0.0 && s < 1.0, "loopback RTT out of range: {}", s);
            break;
        }
        assert!(Instant::now() < deadline, "RTT stats never populated");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_channels_are_independent_streams() {
    let (server, client) = server_client_pair(Config::default());
    wait_connected(&client);

    // Interleave three channels; per-channel order must hold.
    for i in 0..10u8 {
        for channel in 0..3u8 {
            client
                .send(PEER_ID_SERVER, channel, vec![channel, i], true)
                .unwrap();
        }
    }

    let mut next_per_channel = [0u8; 3];
    for _ in 0..30 {
        let (_, data) = wait_for_data(&server);
        let channel = data[0] as usize;
        assert_eq!(data[1], next_per_channel[channel], "order broke on channel {}", channel);
        next_per_channel[channel] += 1;
    }
    assert_eq!(next_per_channel, [10, 10, 10]);
}
