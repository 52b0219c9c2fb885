//! Receiving side of reliable packet delivery.

use std::{cmp::Ordering, collections::BinaryHeap};

use tracing::{trace, warn};

use tightbeam_core::constants::{MAX_RELIABLE_WINDOW_SIZE, SEQNUM_INITIAL};

use crate::{packet::ReceivedPacket, seqnum::compute_full_seqnum};

/// Wrapper ordering parked packets as a min-heap by full seqnum.
struct QueuedReliable(Box<ReceivedPacket>);

impl PartialEq for QueuedReliable {
    fn eq(&self, other: &Self) -> bool {
        self.0.reliable.full_seqnum == other.0.reliable.full_seqnum
    }
}

impl Eq for QueuedReliable {}

impl PartialOrd for QueuedReliable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedReliable {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the std max-heap yields the smallest seqnum first.
        other.0.reliable.full_seqnum.cmp(&self.0.reliable.full_seqnum)
    }
}

/// Buffers incoming reliable packets, releasing them upward in strict
/// seqnum order, exactly once each, and acknowledging every arrival
/// inside the window.
///
/// Wire seqnums are 16 bits; the buffer tracks a 64-bit
/// `next_incoming_seqnum` and extends every arrival to its full 64-bit
/// position so ranges stay monotonically comparable across wrap-arounds
/// and long outages.
///
/// `insert` takes two callbacks: `send_ack` is invoked for every arrival
/// that must be acknowledged, and `process` for every packet released in
/// order. `process` returns `false` if the connection was torn down
/// during processing, which halts any further draining.
///
/// May only be used from the receive worker.
pub struct ReliableReceiveBuffer {
    next_incoming_seqnum: u64,
    queue: BinaryHeap<QueuedReliable>,
}

impl ReliableReceiveBuffer {
    /// Creates a buffer expecting the initial seqnum.
    pub fn new() -> Self {
        Self { next_incoming_seqnum: u64::from(SEQNUM_INITIAL), queue: BinaryHeap::new() }
    }

    /// The full seqnum the next in-order delivery will carry.
    pub fn next_incoming_seqnum(&self) -> u64 {
        self.next_incoming_seqnum
    }

    /// Number of packets parked waiting for a gap to fill.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Accepts one reliable packet. The callbacks may be invoked several
    /// times before this returns.
    pub fn insert<A, P>(&mut self, mut rpkt: Box<ReceivedPacket>, mut send_ack: A, mut process: P)
    where
        A: FnMut(&ReceivedPacket),
        P: FnMut(Box<ReceivedPacket>) -> bool,
    {
        debug_assert!(rpkt.is_reliable);
        let full_seqnum = compute_full_seqnum(self.next_incoming_seqnum, rpkt.reliable.seqnum);
        rpkt.reliable.full_seqnum = full_seqnum;

        if full_seqnum > self.next_incoming_seqnum + u64::from(MAX_RELIABLE_WINDOW_SIZE) {
            // Too far in the future; discard without an ack. If this is a
            // valid packet it will be retransmitted.
            warn!(uuid = %rpkt.uuid, full_seqnum, "reliable packet too far in the future, ignoring");
            return;
        }

        // Ack everything else, duplicates included: acks are idempotent
        // and a duplicate ack is cheaper than a sender backoff.
        send_ack(&rpkt);

        if full_seqnum < self.next_incoming_seqnum {
            trace!(uuid = %rpkt.uuid, full_seqnum, "duplicate reliable packet, already processed");
            return;
        }

        if full_seqnum == self.next_incoming_seqnum {
            // Process it right away.
            self.next_incoming_seqnum += 1;
            if !process(rpkt) {
                // Connection closed.
                return;
            }
            // Release any parked packets that are now contiguous.
            self.flush(&mut process);
            return;
        }
        self.queue.push(QueuedReliable(rpkt));
    }

    fn flush<P>(&mut self, process: &mut P)
    where
        P: FnMut(Box<ReceivedPacket>) -> bool,
    {
        while let Some(top) = self.queue.peek() {
            if top.0.reliable.full_seqnum > self.next_incoming_seqnum {
                break;
            }
            let rpkt = self.queue.pop().expect("peeked entry").0;
            if rpkt.reliable.full_seqnum < self.next_incoming_seqnum {
                // A duplicate can park here while a gap exists; the ack
                // already went out when it arrived.
                trace!(uuid = %rpkt.uuid, "discarding duplicate parked packet");
                continue;
            }
            debug_assert_eq!(rpkt.reliable.full_seqnum, self.next_incoming_seqnum);
            self.next_incoming_seqnum += 1;
            if !process(rpkt) {
                // Connection closed.
                return;
            }
        }
    }
}

impl Default for ReliableReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use byteorder::{BigEndian, WriteBytesExt};

    use tightbeam_core::constants::PROTOCOL_ID;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:30000".parse().unwrap()
    }

    fn reliable_packet(seqnum: u16, payload: &[u8]) -> Box<ReceivedPacket> {
        let mut data = Vec::new();
        data.write_u32::<BigEndian>(PROTOCOL_ID).unwrap();
        data.write_u16::<BigEndian>(2).unwrap();
        data.push(0);
        data.push(3); // RELIABLE
        data.write_u16::<BigEndian>(seqnum).unwrap();
        data.push(1); // ORIGINAL
        data.extend_from_slice(payload);
        ReceivedPacket::parse(data, addr(), 0).unwrap()
    }

    struct Harness {
        buffer: ReliableReceiveBuffer,
        acks: Vec<u16>,
        delivered: Vec<Vec<u8>>,
    }

    impl Harness {
        fn new() -> Self {
            Self { buffer: ReliableReceiveBuffer::new(), acks: Vec::new(), delivered: Vec::new() }
        }

        fn insert(&mut self, seqnum: u16, payload: &[u8]) {
            let acks = &mut self.acks;
            let delivered = &mut self.delivered;
            self.buffer.insert(
                reliable_packet(seqnum, payload),
                |rpkt| acks.push(rpkt.reliable.seqnum),
                |rpkt| {
                    delivered.push(rpkt.contents().to_vec());
                    true
                },
            );
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut h = Harness::new();
        h.insert(65500, b"a");
        h.insert(65501, b"b");
        assert_eq!(h.delivered, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(h.acks, vec![65500, 65501]);
        assert_eq!(h.buffer.next_incoming_seqnum(), 65502);
    }

    #[test]
    fn test_reorder_with_duplicate() {
        // Arrivals (65502, 65500, 65503, 65500, 65501): delivery must be
        // 65500..=65503 exactly once each, with an ack per arrival.
        let mut h = Harness::new();
        h.insert(65502, b"c");
        h.insert(65500, b"a");
        h.insert(65503, b"d");
        h.insert(65500, b"a");
        h.insert(65501, b"b");

        assert_eq!(
            h.delivered,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(h.acks, vec![65502, 65500, 65503, 65500, 65501]);
        assert_eq!(h.buffer.next_incoming_seqnum(), 65504);
        assert_eq!(h.buffer.pending(), 0);
    }

    #[test]
    fn test_duplicate_acked_but_not_redelivered() {
        let mut h = Harness::new();
        for _ in 0..5 {
            h.insert(65500, b"x");
        }
        assert_eq!(h.delivered.len(), 1);
        assert_eq!(h.acks.len(), 5);
    }

    #[test]
    fn test_duplicate_parked_while_gap_open() {
        // A duplicate of a parked out-of-order packet sits in the queue
        // until the gap closes, then is dropped by the flush guard.
        let mut h = Harness::new();
        h.insert(65502, b"c");
        h.insert(65502, b"c");
        assert_eq!(h.buffer.pending(), 2);
        h.insert(65500, b"a");
        h.insert(65501, b"b");
        assert_eq!(
            h.delivered,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(h.buffer.pending(), 0);
    }

    #[test]
    fn test_window_overflow_dropped_without_ack() {
        let mut h = Harness::new();
        let too_far = 65500u16.wrapping_add(MAX_RELIABLE_WINDOW_SIZE + 1);
        h.insert(too_far, b"x");
        assert!(h.acks.is_empty());
        assert!(h.delivered.is_empty());
        assert_eq!(h.buffer.pending(), 0);
    }

    #[test]
    fn test_delivery_across_wraparound() {
        let mut h = Harness::new();
        let mut expected = Vec::new();
        for i in 0..100u16 {
            let seqnum = 65500u16.wrapping_add(i);
            h.insert(seqnum, &i.to_be_bytes());
            expected.push(i.to_be_bytes().to_vec());
        }
        assert_eq!(h.delivered, expected);
        assert_eq!(h.buffer.next_incoming_seqnum(), 65500 + 100);
    }

    #[test]
    fn test_next_seqnum_strictly_increases() {
        let mut h = Harness::new();
        let mut last = h.buffer.next_incoming_seqnum();
        let arrivals = [65502u16, 65500, 65500, 65505, 65501, 65503, 65504];
        for seqnum in arrivals {
            h.insert(seqnum, b"p");
            let now = h.buffer.next_incoming_seqnum();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 65506);
    }

    #[test]
    fn test_processing_stops_when_callback_reports_teardown() {
        let mut buffer = ReliableReceiveBuffer::new();
        let mut delivered = 0;
        buffer.insert(reliable_packet(65501, b"b"), |_| {}, |_| true);
        buffer.insert(reliable_packet(65502, b"c"), |_| {}, |_| true);
        buffer.insert(
            reliable_packet(65500, b"a"),
            |_| {},
            |_| {
                delivered += 1;
                // Pretend the connection went away during processing.
                false
            },
        );
        assert_eq!(delivered, 1);
        // The parked packets stay parked.
        assert_eq!(buffer.pending(), 2);
    }
}
