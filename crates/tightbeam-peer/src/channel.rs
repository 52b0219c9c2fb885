//! Per-channel state: sequence counters, the reliable window, packet
//! queues and rate statistics.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tightbeam_core::{
    constants::{
        MAX_RELIABLE_WINDOW_SIZE, MIN_RELIABLE_WINDOW_SIZE, SEQNUM_INITIAL,
    },
    SeqNum,
};
use tightbeam_protocol::{
    framing::BufferedPacket, ReliableReceiveBuffer, ReliableSendBuffer,
};

use crate::split_buffer::IncomingSplitBuffer;

/// Which local rate statistic to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStat {
    /// KB/s put on the wire in the last window.
    CurDownRate,
    /// Smoothed KB/s put on the wire.
    AvgDownRate,
    /// KB/s received in the last window.
    CurIncomingRate,
    /// Smoothed KB/s received.
    AvgIncomingRate,
    /// KB/s lost to retransmission in the last window.
    CurLossRate,
    /// Smoothed KB/s lost.
    AvgLossRate,
}

struct ChannelState {
    next_outgoing_seqnum: SeqNum,
    next_outgoing_split_seqnum: SeqNum,
    window_size: SeqNum,

    current_packet_loss: u32,
    current_packet_successful: u32,
    loss_counter: f32,

    current_bytes_transfered: u32,
    current_bytes_received: u32,
    current_bytes_lost: u32,
    rate_counter: f32,

    cur_kbs: f32,
    max_kbs: f32,
    avg_kbs: f32,
    cur_incoming_kbs: f32,
    max_incoming_kbs: f32,
    avg_incoming_kbs: f32,
    cur_kbs_lost: f32,
    max_kbs_lost: f32,
    avg_kbs_lost: f32,
}

/// One of the three independent streams of a peer.
///
/// The incoming buffers are touched only by the receive worker and the
/// outgoing queues only by the send worker; the unacked store and the
/// counters here are shared between both and internally locked.
pub struct Channel {
    state: Mutex<ChannelState>,

    /// Buffers incoming reliable packets arriving in the wrong order.
    pub incoming_reliables: Mutex<ReliableReceiveBuffer>,
    /// Buffers sent reliable packets until the matching ack arrives.
    pub outgoing_reliables_sent: ReliableSendBuffer,
    /// Reliable packets framed and waiting for window room.
    pub queued_reliables: Mutex<VecDeque<BufferedPacket>>,
    /// User payloads queued before splitting into packets.
    pub queued_commands: Mutex<VecDeque<Vec<u8>>>,
    /// Reassembly state for incoming split packets.
    pub incoming_splits: Mutex<IncomingSplitBuffer>,
}

impl Channel {
    /// Creates a channel with all counters at their initial values.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                next_outgoing_seqnum: SEQNUM_INITIAL,
                next_outgoing_split_seqnum: SEQNUM_INITIAL,
                window_size: MIN_RELIABLE_WINDOW_SIZE,
                current_packet_loss: 0,
                current_packet_successful: 0,
                loss_counter: 0.0,
                current_bytes_transfered: 0,
                current_bytes_received: 0,
                current_bytes_lost: 0,
                rate_counter: 0.0,
                cur_kbs: 0.0,
                max_kbs: 0.0,
                avg_kbs: 0.0,
                cur_incoming_kbs: 0.0,
                max_incoming_kbs: 0.0,
                avg_incoming_kbs: 0.0,
                cur_kbs_lost: 0.0,
                max_kbs_lost: 0.0,
                avg_kbs_lost: 0.0,
            }),
            incoming_reliables: Mutex::new(ReliableReceiveBuffer::new()),
            outgoing_reliables_sent: ReliableSendBuffer::new(),
            queued_reliables: Mutex::new(VecDeque::new()),
            queued_commands: Mutex::new(VecDeque::new()),
            incoming_splits: Mutex::new(IncomingSplitBuffer::new()),
        }
    }

    /// Allocates the next outgoing reliable seqnum, refusing when the
    /// unacked window is full.
    pub fn acquire_outgoing_seqnum(&self) -> Option<SeqNum> {
        let lowest_unacked = self.outgoing_reliables_sent.first_seqnum();
        let mut state = self.lock();
        if let Some(lowest) = lowest_unacked {
            let in_flight = state.next_outgoing_seqnum.wrapping_sub(lowest);
            if in_flight >= state.window_size {
                return None;
            }
        }
        let seqnum = state.next_outgoing_seqnum;
        state.next_outgoing_seqnum = seqnum.wrapping_add(1);
        Some(seqnum)
    }

    /// Peeks at the next outgoing seqnum without allocating.
    pub fn read_outgoing_seqnum(&self) -> SeqNum {
        self.lock().next_outgoing_seqnum
    }

    /// Returns a seqnum allocated but never used, e.g. when admission
    /// was refused after allocation. Only the most recent allocation can
    /// be returned.
    pub fn put_back_seqnum(&self, seqnum: SeqNum) -> bool {
        let mut state = self.lock();
        if state.next_outgoing_seqnum == seqnum.wrapping_add(1) {
            state.next_outgoing_seqnum = seqnum;
            true
        } else {
            false
        }
    }

    /// Current split-stream seqnum.
    pub fn split_seqnum(&self) -> SeqNum {
        self.lock().next_outgoing_split_seqnum
    }

    /// Stores the split-stream seqnum after auto-splitting advanced it.
    pub fn set_split_seqnum(&self, seqnum: SeqNum) {
        self.lock().next_outgoing_split_seqnum = seqnum;
    }

    /// Current reliable window size.
    pub fn window_size(&self) -> SeqNum {
        self.lock().window_size
    }

    /// Sets the window size, clamped to the protocol bounds.
    pub fn set_window_size(&self, size: SeqNum) {
        self.lock().window_size =
            size.clamp(MIN_RELIABLE_WINDOW_SIZE, MAX_RELIABLE_WINDOW_SIZE);
    }

    /// Records packets confirmed lost (timed out and re-sent).
    pub fn update_packet_loss_counter(&self, count: u32) {
        self.lock().current_packet_loss += count;
    }

    /// Records packets acked without retransmission.
    pub fn update_packet_success_counter(&self, count: u32) {
        self.lock().current_packet_successful += count;
    }

    /// Records bytes put on the wire.
    pub fn update_bytes_sent(&self, bytes: u32) {
        self.lock().current_bytes_transfered += bytes;
    }

    /// Records bytes received.
    pub fn update_bytes_received(&self, bytes: u32) {
        self.lock().current_bytes_received += bytes;
    }

    /// Records bytes re-sent after a timeout.
    pub fn update_bytes_lost(&self, bytes: u32) {
        self.lock().current_bytes_lost += bytes;
    }

    /// Advances the statistics windows. Once per second of accumulated
    /// `dtime` this folds the byte counters into the rate statistics and
    /// resizes the reliable window from the observed loss ratio.
    pub fn update_timers(&self, dtime: f32) {
        let mut state = self.lock();
        state.loss_counter += dtime;
        state.rate_counter += dtime;

        if state.loss_counter > 1.0 {
            let lost = state.current_packet_loss;
            let successful = state.current_packet_successful;
            state.current_packet_loss = 0;
            state.current_packet_successful = 0;
            state.loss_counter = 0.0;

            let window = state.window_size;
            state.window_size = if successful == 0 && lost > 0 {
                window.saturating_sub(10).max(MIN_RELIABLE_WINDOW_SIZE)
            } else if successful > 0 {
                let ratio = lost as f32 / successful as f32;
                if ratio < 0.01 {
                    window.saturating_add(100).min(MAX_RELIABLE_WINDOW_SIZE)
                } else if ratio < 0.05 {
                    window.saturating_add(50).min(MAX_RELIABLE_WINDOW_SIZE)
                } else if ratio > 0.15 {
                    window.saturating_sub(100).max(MIN_RELIABLE_WINDOW_SIZE)
                } else if ratio > 0.1 {
                    window.saturating_sub(50).max(MIN_RELIABLE_WINDOW_SIZE)
                } else {
                    window
                }
            } else {
                window
            };
        }

        if state.rate_counter > 1.0 {
            let interval = state.rate_counter;
            state.cur_kbs = state.current_bytes_transfered as f32 / interval / 1024.0;
            state.cur_incoming_kbs = state.current_bytes_received as f32 / interval / 1024.0;
            state.cur_kbs_lost = state.current_bytes_lost as f32 / interval / 1024.0;
            state.current_bytes_transfered = 0;
            state.current_bytes_received = 0;
            state.current_bytes_lost = 0;
            state.rate_counter = 0.0;

            state.max_kbs = state.max_kbs.max(state.cur_kbs);
            state.max_incoming_kbs = state.max_incoming_kbs.max(state.cur_incoming_kbs);
            state.max_kbs_lost = state.max_kbs_lost.max(state.cur_kbs_lost);
            state.avg_kbs = state.avg_kbs * 0.9 + state.cur_kbs * 0.1;
            state.avg_incoming_kbs = state.avg_incoming_kbs * 0.9 + state.cur_incoming_kbs * 0.1;
            state.avg_kbs_lost = state.avg_kbs_lost * 0.9 + state.cur_kbs_lost * 0.1;
        }
    }

    /// Reads one rate statistic.
    pub fn rate_stat(&self, kind: RateStat) -> f32 {
        let state = self.lock();
        match kind {
            RateStat::CurDownRate => state.cur_kbs,
            RateStat::AvgDownRate => state.avg_kbs,
            RateStat::CurIncomingRate => state.cur_incoming_kbs,
            RateStat::AvgIncomingRate => state.avg_incoming_kbs,
            RateStat::CurLossRate => state.cur_kbs_lost,
            RateStat::AvgLossRate => state.avg_kbs_lost,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state poisoned")
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("next_outgoing_seqnum", &state.next_outgoing_seqnum)
            .field("window_size", &state.window_size)
            .field("unacked", &self.outgoing_reliables_sent.len())
            .finish()
    }
}
