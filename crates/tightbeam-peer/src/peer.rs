//! Peer state and lifecycle flags.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
};

use tightbeam_core::{config::Config, constants::CHANNEL_COUNT, SessionId};

use crate::{
    channel::{Channel, RateStat},
    rtt::{RttEstimator, RttStat},
};

struct PeerState {
    rtt: RttEstimator,
    /// Seconds since the last datagram arrived from this peer.
    timeout_counter: f32,
    /// Seconds since the last ping went out.
    ping_timer: f32,
}

/// A remote endpoint of a connection.
///
/// Peers are shared between the workers and the user API as `Arc<Peer>`;
/// the registry stops handing out new references once `pending_deletion`
/// is set and frees the entry when it holds the last one.
pub struct Peer {
    /// Session id this peer is registered under. Fixed for the peer's
    /// lifetime.
    pub id: SessionId,
    /// Remote address.
    pub address: SocketAddr,
    /// The three independent streams to this peer.
    pub channels: [Channel; CHANNEL_COUNT as usize],

    state: Mutex<PeerState>,
    /// Dynamic retransmission timeout in milliseconds.
    resend_timeout_ms: AtomicU32,
    pending_deletion: AtomicBool,
    pending_disconnect: AtomicBool,

    resend_timeout_min: f32,
    resend_timeout_max: f32,
    resend_timeout_factor: f32,
}

impl Peer {
    /// Creates a peer in its initial state.
    pub fn new(id: SessionId, address: SocketAddr, config: &Config) -> Self {
        Self {
            id,
            address,
            channels: std::array::from_fn(|_| Channel::new()),
            state: Mutex::new(PeerState {
                rtt: RttEstimator::new(),
                timeout_counter: 0.0,
                ping_timer: 0.0,
            }),
            resend_timeout_ms: AtomicU32::new(500),
            pending_deletion: AtomicBool::new(false),
            pending_disconnect: AtomicBool::new(false),
            resend_timeout_min: config.resend_timeout_min,
            resend_timeout_max: config.resend_timeout_max,
            resend_timeout_factor: config.resend_timeout_factor,
        }
    }

    /// Channel by wire index. `None` for an out-of-range index (the
    /// parser already rejects those on the receive path).
    pub fn channel(&self, index: u8) -> Option<&Channel> {
        self.channels.get(usize::from(index))
    }

    /// Clears the idle counter; called on every datagram from this peer.
    pub fn reset_timeout(&self) {
        self.lock().timeout_counter = 0.0;
    }

    /// Advances the idle counter and reports whether the peer has been
    /// silent longer than `limit` seconds.
    pub fn check_timed_out(&self, dtime: f32, limit: f32) -> bool {
        let mut state = self.lock();
        state.timeout_counter += dtime;
        state.timeout_counter > limit
    }

    /// Advances the ping timer; true when a ping is due (and the timer
    /// was reset).
    pub fn ping_due(&self, dtime: f32, interval: f32) -> bool {
        let mut state = self.lock();
        state.ping_timer += dtime;
        if state.ping_timer >= interval {
            state.ping_timer = 0.0;
            true
        } else {
            false
        }
    }

    /// Feeds one RTT observation (seconds) and recomputes the
    /// retransmission timeout from the smoothed average.
    pub fn report_rtt(&self, rtt: f32) {
        let mut state = self.lock();
        state.rtt.record(rtt);
        let avg = state.rtt.avg_rtt().unwrap_or(rtt);
        drop(state);

        let timeout = (avg * self.resend_timeout_factor)
            .clamp(self.resend_timeout_min, self.resend_timeout_max);
        self.resend_timeout_ms.store((timeout * 1000.0) as u32, Ordering::Relaxed);
    }

    /// Current retransmission timeout in seconds.
    pub fn resend_timeout(&self) -> f32 {
        self.resend_timeout_ms.load(Ordering::Relaxed) as f32 / 1000.0
    }

    /// Reads one RTT statistic.
    pub fn rtt_stat(&self, kind: RttStat) -> Option<f32> {
        self.lock().rtt.stat(kind)
    }

    /// Sums one rate statistic across this peer's channels.
    pub fn rate_stat(&self, kind: RateStat) -> f32 {
        self.channels.iter().map(|c| c.rate_stat(kind)).sum()
    }

    /// True once the peer is condemned; no new handles are vended.
    pub fn is_pending_deletion(&self) -> bool {
        self.pending_deletion.load(Ordering::Acquire)
    }

    /// Condemns the peer. One-way.
    pub fn mark_pending_deletion(&self) {
        self.pending_deletion.store(true, Ordering::Release);
    }

    /// True once a DISCO should go out when the queues drain.
    pub fn is_pending_disconnect(&self) -> bool {
        self.pending_disconnect.load(Ordering::Acquire)
    }

    /// Requests an orderly disconnect after queued data flushes.
    pub fn mark_pending_disconnect(&self) {
        self.pending_disconnect.store(true, Ordering::Release);
    }

    /// True when every channel's outgoing queues are empty.
    pub fn outgoing_drained(&self) -> bool {
        self.channels.iter().all(|c| {
            c.queued_commands.lock().expect("queued commands poisoned").is_empty()
                && c.queued_reliables.lock().expect("queued reliables poisoned").is_empty()
                && c.outgoing_reliables_sent.is_empty()
        })
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().expect("peer state poisoned")
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("pending_deletion", &self.is_pending_deletion())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(2, "127.0.0.1:30000".parse().unwrap(), &Config::default())
    }

    #[test]
    fn test_timeout_counting_and_reset() {
        let p = peer();
        assert!(!p.check_timed_out(10.0, 30.0));
        assert!(!p.check_timed_out(10.0, 30.0));
        assert!(p.check_timed_out(15.0, 30.0));

        p.reset_timeout();
        assert!(!p.check_timed_out(10.0, 30.0));
    }

    #[test]
    fn test_ping_cadence() {
        let p = peer();
        assert!(!p.ping_due(2.0, 5.0));
        assert!(p.ping_due(3.0, 5.0));
        // Timer was reset by the ping.
        assert!(!p.ping_due(3.0, 5.0));
        assert!(p.ping_due(2.0, 5.0));
    }

    #[test]
    fn test_resend_timeout_follows_rtt() {
        let p = peer();
        assert!((p.resend_timeout() - 0.5).abs() < 1e-3, "cold start default");

        // LAN-grade RTT hits the floor rather than going hyperactive.
        for _ in 0..10 {
            p.report_rtt(0.001);
        }
        assert!((p.resend_timeout() - 0.1).abs() < 1e-3);

        // Slow links push the timeout up, bounded by the ceiling.
        for _ in 0..300 {
            p.report_rtt(2.0);
        }
        assert!((p.resend_timeout() - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_rtt_stats_exposed() {
        let p = peer();
        assert_eq!(p.rtt_stat(RttStat::AvgRtt), None);
        p.report_rtt(0.2);
        assert_eq!(p.rtt_stat(RttStat::AvgRtt), Some(0.2));
        assert_eq!(p.rtt_stat(RttStat::MinRtt), Some(0.2));
    }

    #[test]
    fn test_lifecycle_flags() {
        let p = peer();
        assert!(!p.is_pending_deletion());
        p.mark_pending_deletion();
        assert!(p.is_pending_deletion());

        assert!(!p.is_pending_disconnect());
        p.mark_pending_disconnect();
        assert!(p.is_pending_disconnect());
    }

    #[test]
    fn test_outgoing_drained() {
        let p = peer();
        assert!(p.outgoing_drained());
        p.channels[1]
            .queued_commands
            .lock()
            .unwrap()
            .push_back(b"pending".to_vec());
        assert!(!p.outgoing_drained());
    }
}
