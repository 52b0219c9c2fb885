//! Reassembly of split packets.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, warn};

use tightbeam_core::{constants::SPLIT_TIMEOUT_MS, SeqNum, SessionId};
use tightbeam_protocol::packet::{PacketKind, ReceivedPacket};
use tightbeam_util::{TimeoutHandle, TimeoutScheduler};

/// Identifies one reassembly entry on the shared timeout scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitTimeoutToken {
    /// Peer the entry belongs to.
    pub peer_id: SessionId,
    /// Channel within the peer.
    pub channel: u8,
    /// Split seqnum of the entry.
    pub seqnum: SeqNum,
}

struct IncomingSplitPacket {
    chunk_count: u16,
    reliable: bool,
    /// Chunk payloads keyed by chunk number; ascending iteration is the
    /// reassembly order.
    chunks: BTreeMap<u16, Vec<u8>>,
    timeout: TimeoutHandle<SplitTimeoutToken>,
}

impl IncomingSplitPacket {
    fn all_received(&self) -> bool {
        self.chunks.len() == usize::from(self.chunk_count)
    }

    fn reassemble(self) -> Vec<u8> {
        debug_assert!(self.all_received());
        let total: usize = self.chunks.values().map(Vec::len).sum();
        let mut full = Vec::with_capacity(total);
        for chunk in self.chunks.into_values() {
            full.extend_from_slice(&chunk);
        }
        full
    }
}

/// A buffer reconstructing split packets, keyed by split seqnum.
///
/// Returns the reassembled payload from `insert` once every chunk of a
/// seqnum has arrived. Unreliable entries are dropped after 30 ms of
/// inactivity (the timer rearms on every new chunk); reliable entries
/// never time out because the reliable layer guarantees the remaining
/// chunks will arrive.
///
/// May only be used from the receive worker.
pub struct IncomingSplitBuffer {
    entries: HashMap<SeqNum, IncomingSplitPacket>,
}

impl IncomingSplitBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Number of messages currently mid-reassembly.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is mid-reassembly.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts one split chunk. Returns the full payload when this chunk
    /// completed the message.
    pub fn insert(
        &mut self,
        rpkt: Box<ReceivedPacket>,
        scheduler: &TimeoutScheduler<SplitTimeoutToken>,
        peer_id: SessionId,
        now_ms: u64,
    ) -> Option<Vec<u8>> {
        let PacketKind::Split { seqnum, chunk_count, chunk_num } = rpkt.kind else {
            debug_assert!(false, "non-split packet in the split buffer");
            return None;
        };
        let channel = rpkt.channel;
        let token = SplitTimeoutToken { peer_id, channel, seqnum };

        let entry = self.entries.entry(seqnum).or_insert_with(|| IncomingSplitPacket {
            chunk_count,
            reliable: rpkt.is_reliable,
            chunks: BTreeMap::new(),
            timeout: scheduler.handle(),
        });

        if entry.chunk_count != chunk_count {
            error!(
                uuid = %rpkt.uuid,
                expected = entry.chunk_count,
                got = chunk_count,
                "split chunk_count mismatch, dropping chunk"
            );
            return None;
        }
        if entry.reliable != rpkt.is_reliable {
            warn!(
                uuid = %rpkt.uuid,
                entry_reliable = entry.reliable,
                packet_reliable = rpkt.is_reliable,
                "split reliability flag mismatch"
            );
        }

        // Identical chunks can arrive when the remote re-sends under lag;
        // keep the first.
        if entry.chunks.contains_key(&chunk_num) {
            return None;
        }
        entry.chunks.insert(chunk_num, rpkt.into_contents());
        if !entry.reliable {
            entry.timeout.set_timeout(now_ms, SPLIT_TIMEOUT_MS, token);
        }

        if entry.all_received() {
            let entry = self.entries.remove(&seqnum).expect("entry just touched");
            return Some(entry.reassemble());
        }
        None
    }

    /// Drops a timed-out entry, losing its partial data. Called when the
    /// scheduler delivers this buffer's token.
    pub fn handle_timeout(&mut self, seqnum: SeqNum) {
        if self.entries.remove(&seqnum).is_some() {
            debug!(seqnum, "removing timed out unreliable split packet");
        }
    }
}

impl Default for IncomingSplitBuffer {
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

    fn split_packet(
        seqnum: u16,
        chunk_count: u16,
        chunk_num: u16,
        payload: &[u8],
        reliable: bool,
    ) -> Box<ReceivedPacket> {
        let mut data = Vec::new();
        data.write_u32::<BigEndian>(PROTOCOL_ID).unwrap();
        data.write_u16::<BigEndian>(2).unwrap();
        data.push(0);
        if reliable {
            data.push(3);
            data.write_u16::<BigEndian>(100).unwrap();
        }
        data.push(2); // SPLIT
        data.write_u16::<BigEndian>(seqnum).unwrap();
        data.write_u16::<BigEndian>(chunk_count).unwrap();
        data.write_u16::<BigEndian>(chunk_num).unwrap();
        data.extend_from_slice(payload);
        ReceivedPacket::parse(data, addr(), 0).unwrap()
    }

    fn scheduler() -> TimeoutScheduler<SplitTimeoutToken> {
        TimeoutScheduler::new()
    }

    #[test]
    fn test_reassembles_out_of_order() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();

        assert!(buffer.insert(split_packet(7, 3, 2, b"!", false), &sched, 2, 0).is_none());
        assert!(buffer.insert(split_packet(7, 3, 0, b"hello ", false), &sched, 2, 0).is_none());
        let full = buffer.insert(split_packet(7, 3, 1, b"world", false), &sched, 2, 0);
        assert_eq!(full.unwrap(), b"hello world!".to_vec());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        assert!(buffer.insert(split_packet(7, 2, 0, b"first", false), &sched, 2, 0).is_none());
        assert!(buffer.insert(split_packet(7, 2, 0, b"again", false), &sched, 2, 0).is_none());
        let full = buffer.insert(split_packet(7, 2, 1, b"-rest", false), &sched, 2, 0);
        assert_eq!(full.unwrap(), b"first-rest".to_vec());
    }

    #[test]
    fn test_chunk_count_mismatch_dropped() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        assert!(buffer.insert(split_packet(7, 3, 0, b"a", false), &sched, 2, 0).is_none());
        // A chunk claiming a different count for the same seqnum is bogus.
        assert!(buffer.insert(split_packet(7, 4, 1, b"b", false), &sched, 2, 0).is_none());
        assert_eq!(buffer.len(), 1);
        assert!(buffer.insert(split_packet(7, 3, 1, b"b", false), &sched, 2, 0).is_none());
        let full = buffer.insert(split_packet(7, 3, 2, b"c", false), &sched, 2, 0);
        assert_eq!(full.unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_unreliable_entry_times_out() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        buffer.insert(split_packet(7, 2, 0, b"a", false), &sched, 2, 1_000);

        let mut expired = Vec::new();
        sched.process(1_000 + SPLIT_TIMEOUT_MS + 1, |token| expired.push(token));
        assert_eq!(
            expired,
            vec![SplitTimeoutToken { peer_id: 2, channel: 0, seqnum: 7 }]
        );
        buffer.handle_timeout(7);
        assert!(buffer.is_empty());

        // A late chunk after the drop starts a fresh entry.
        buffer.insert(split_packet(7, 2, 1, b"b", false), &sched, 2, 2_000);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_new_chunk_rearms_timeout() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        buffer.insert(split_packet(7, 3, 0, b"a", false), &sched, 2, 1_000);
        // 20 ms later another chunk arrives; expiry moves to 1020 + 30.
        buffer.insert(split_packet(7, 3, 1, b"b", false), &sched, 2, 1_020);

        let mut expired = Vec::new();
        sched.process(1_031, |token| expired.push(token));
        assert!(expired.is_empty(), "rearmed entry must not expire at the old deadline");
        sched.process(1_051, |token| expired.push(token));
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_reliable_entry_never_times_out() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        buffer.insert(split_packet(7, 2, 0, b"a", true), &sched, 2, 0);
        assert!(sched.is_empty(), "reliable reassembly must not arm a timeout");

        let mut expired = Vec::new();
        sched.process(u64::MAX, |token| expired.push(token));
        assert!(expired.is_empty());
        let full = buffer.insert(split_packet(7, 2, 1, b"b", true), &sched, 2, 0);
        assert_eq!(full.unwrap(), b"ab".to_vec());
    }

    #[test]
    fn test_completion_cancels_timeout() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        buffer.insert(split_packet(7, 2, 0, b"a", false), &sched, 2, 0);
        buffer.insert(split_packet(7, 2, 1, b"b", false), &sched, 2, 0).unwrap();
        assert!(sched.is_empty(), "completed entry must cancel its pending timeout");
    }

    #[test]
    fn test_auto_split_round_trip_any_order() {
        use tightbeam_protocol::{make_auto_split, make_packet};

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let mut split_seqnum = 65500;
        let frames = make_auto_split(&payload, 1400, &mut split_seqnum);
        assert!(frames.len() > 2);

        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        let mut result = None;
        // Deliver the chunks back to front; only the last insert completes.
        for frame in frames.iter().rev() {
            let pkt = make_packet(addr(), frame, 2, 0);
            let rpkt = ReceivedPacket::parse(pkt.data, addr(), 0).unwrap();
            let done = buffer.insert(rpkt, &sched, 2, 0);
            assert!(result.is_none() || done.is_none());
            result = result.or(done);
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn test_independent_seqnums() {
        let sched = scheduler();
        let mut buffer = IncomingSplitBuffer::new();
        buffer.insert(split_packet(1, 2, 0, b"a1", false), &sched, 2, 0);
        buffer.insert(split_packet(2, 2, 0, b"b1", false), &sched, 2, 0);
        assert_eq!(buffer.len(), 2);
        let full = buffer.insert(split_packet(2, 2, 1, b"b2", false), &sched, 2, 0);
        assert_eq!(full.unwrap(), b"b1b2".to_vec());
        assert_eq!(buffer.len(), 1);
    }
}
