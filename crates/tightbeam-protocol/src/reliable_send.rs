//! Sending side of reliable delivery: the store of transmitted packets
//! awaiting acknowledgment.

use std::sync::Mutex;

use tracing::error;

use tightbeam_core::SeqNum;

use crate::framing::BufferedPacket;

struct Entry {
    seqnum: SeqNum,
    packet: BufferedPacket,
}

struct Inner {
    /// Kept sorted by seqnum distance from the oldest expected ack, so
    /// the first element is the oldest unacked packet even across the
    /// 16-bit wrap.
    list: Vec<Entry>,
}

/// Buffers reliable packets after transmission so they can be re-sent
/// until the matching ack arrives.
///
/// Internally serialized: the send worker inserts on transmit while the
/// receive worker removes on ack.
pub struct ReliableSendBuffer {
    inner: Mutex<Inner>,
}

impl ReliableSendBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { list: Vec::new() }) }
    }

    /// Number of unacked packets.
    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    /// True when nothing is awaiting an ack.
    pub fn is_empty(&self) -> bool {
        self.lock().list.is_empty()
    }

    /// Seqnum of the oldest unacked packet.
    pub fn first_seqnum(&self) -> Option<SeqNum> {
        self.lock().list.first().map(|e| e.seqnum)
    }

    /// Inserts a transmitted packet. `next_expected` is the oldest
    /// seqnum that can still be unacked; ordering is relative to it so
    /// wrapped seqnums sort correctly.
    pub fn insert(&self, packet: BufferedPacket, next_expected: SeqNum) {
        let Some(seqnum) = packet.seqnum() else {
            error!("refusing to buffer a packet without a reliable header");
            debug_assert!(false, "non-reliable packet in the reliable send buffer");
            return;
        };
        let mut inner = self.lock();
        let key = seqnum.wrapping_sub(next_expected);
        let pos = inner
            .list
            .partition_point(|e| e.seqnum.wrapping_sub(next_expected) < key);
        debug_assert!(
            inner.list.iter().all(|e| e.seqnum != seqnum),
            "duplicate seqnum {} in the reliable send buffer",
            seqnum
        );
        inner.list.insert(pos, Entry { seqnum, packet });
    }

    /// Removes and returns the oldest unacked packet.
    pub fn pop_first(&self) -> Option<BufferedPacket> {
        let mut inner = self.lock();
        if inner.list.is_empty() {
            return None;
        }
        Some(inner.list.remove(0).packet)
    }

    /// Removes and returns the packet with the given seqnum. `None` when
    /// the seqnum is not buffered (ack for an unknown or already-acked
    /// seqnum).
    pub fn pop_seqnum(&self, seqnum: SeqNum) -> Option<BufferedPacket> {
        let mut inner = self.lock();
        let pos = inner.list.iter().position(|e| e.seqnum == seqnum)?;
        Some(inner.list.remove(pos).packet)
    }

    /// Adds elapsed time to every buffered packet.
    pub fn increment_timeouts(&self, dtime: f32) {
        let mut inner = self.lock();
        for entry in inner.list.iter_mut() {
            entry.packet.time += dtime;
            entry.packet.totaltime += dtime;
        }
    }

    /// Returns copies of up to `max` packets that have waited at least
    /// `timeout` seconds since their last transmission. Each returned
    /// packet's wait clock is reset and its resend counter incremented;
    /// the packets stay buffered until acked.
    pub fn timed_outs(&self, timeout: f32, max: usize) -> Vec<BufferedPacket> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        for entry in inner.list.iter_mut() {
            if out.len() >= max {
                break;
            }
            if entry.packet.time >= timeout {
                entry.packet.time = 0.0;
                entry.packet.resend_count += 1;
                out.push(entry.packet.clone());
            }
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("reliable send buffer poisoned")
    }
}

impl Default for ReliableSendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReliableSendBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableSendBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::framing::{make_auto_split, make_packet, make_reliable};

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:30000".parse().unwrap()
    }

    fn reliable_buffered(seqnum: u16) -> BufferedPacket {
        let mut split_seqnum = 0;
        let frames = make_auto_split(b"payload", 1400, &mut split_seqnum);
        make_packet(addr(), &make_reliable(&frames[0], seqnum), 1, 0)
    }

    #[test]
    fn test_sorted_by_distance_from_next_expected() {
        let buffer = ReliableSendBuffer::new();
        // Out-of-order insertion across the wrap point.
        for seqnum in [65501, 2, 65500, 0, 65535] {
            buffer.insert(reliable_buffered(seqnum), 65500);
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.first_seqnum(), Some(65500));

        let mut drained = Vec::new();
        while let Some(pkt) = buffer.pop_first() {
            drained.push(pkt.seqnum().unwrap());
        }
        assert_eq!(drained, vec![65500, 65501, 65535, 0, 2]);
    }

    #[test]
    fn test_pop_seqnum() {
        let buffer = ReliableSendBuffer::new();
        for seqnum in [65500, 65501, 65502] {
            buffer.insert(reliable_buffered(seqnum), 65500);
        }
        let popped = buffer.pop_seqnum(65501).unwrap();
        assert_eq!(popped.seqnum(), Some(65501));
        assert_eq!(buffer.len(), 2);
        assert!(buffer.pop_seqnum(65501).is_none(), "second ack finds nothing");
        assert!(buffer.pop_seqnum(123).is_none(), "unknown seqnum ignored");
    }

    #[test]
    fn test_timeout_accounting() {
        let buffer = ReliableSendBuffer::new();
        buffer.insert(reliable_buffered(65500), 65500);
        buffer.insert(reliable_buffered(65501), 65500);

        buffer.increment_timeouts(0.3);
        assert!(buffer.timed_outs(0.5, 10).is_empty());

        buffer.increment_timeouts(0.3);
        let timed_out = buffer.timed_outs(0.5, 10);
        assert_eq!(timed_out.len(), 2);
        assert!(timed_out.iter().all(|p| p.resend_count == 1));

        // Clocks were reset, nothing times out until more time passes.
        assert!(buffer.timed_outs(0.5, 10).is_empty());

        buffer.increment_timeouts(0.6);
        let again = buffer.timed_outs(0.5, 1);
        assert_eq!(again.len(), 1, "max bounds the batch");
        assert_eq!(again[0].resend_count, 2);

        // Total time keeps accumulating across resends.
        let first = buffer.pop_first().unwrap();
        assert!(first.totaltime > 1.1 && first.totaltime < 1.3);
    }

    #[test]
    fn test_len_tracks_contents() {
        let buffer = ReliableSendBuffer::new();
        assert!(buffer.is_empty());
        buffer.insert(reliable_buffered(65500), 65500);
        assert_eq!(buffer.len(), 1);
        buffer.pop_first();
        assert!(buffer.is_empty());
        assert!(buffer.pop_first().is_none());
    }
}
