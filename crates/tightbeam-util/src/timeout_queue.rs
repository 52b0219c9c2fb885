//! Deadline scheduling on top of [`BinHeap`].
//!
//! The main exports of this module are [`TimeoutScheduler`] and
//! [`TimeoutHandle`]. A scheduler is shared (cheaply cloneable) between
//! the owner that processes expirations and the handles that arm them.
//! Time is passed in by the caller as monotonic milliseconds so tests can
//! drive the clock.

use std::{
    cmp::Ordering,
    sync::{Arc, Mutex},
};

use crate::binheap::{BinHeap, NodeKey};

struct TimeoutRecord<T> {
    expiration_ms: u64,
    token: T,
}

impl<T> PartialEq for TimeoutRecord<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expiration_ms == other.expiration_ms
    }
}

impl<T> Eq for TimeoutRecord<T> {}

impl<T> PartialOrd for TimeoutRecord<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimeoutRecord<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiration_ms.cmp(&other.expiration_ms)
    }
}

/// A queue of pending timeouts, each carrying a token delivered to the
/// processing callback on expiry.
///
/// Entries are armed through [`TimeoutHandle`]s; each handle owns at most
/// one pending entry and cancels it when dropped, so a delivered token
/// always corresponds to a handle that was still armed.
pub struct TimeoutScheduler<T> {
    heap: Arc<Mutex<BinHeap<TimeoutRecord<T>>>>,
}

impl<T> Clone for TimeoutScheduler<T> {
    fn clone(&self) -> Self {
        Self { heap: Arc::clone(&self.heap) }
    }
}

impl<T> std::fmt::Debug for TimeoutScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler").finish()
    }
}

impl<T> TimeoutScheduler<T> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self { heap: Arc::new(Mutex::new(BinHeap::new())) }
    }

    /// Returns true if no timeouts are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().expect("timeout heap poisoned").is_empty()
    }

    /// Milliseconds until the next timeout expires, or `None` when the
    /// queue is empty. Returns 0 if there are already expired timeouts.
    pub fn next_timeout_ms(&self, now_ms: u64) -> Option<u64> {
        let heap = self.heap.lock().expect("timeout heap poisoned");
        heap.top().map(|record| record.expiration_ms.saturating_sub(now_ms))
    }

    /// Processes all expired timeouts, delivering each token to `f`.
    ///
    /// Expiry uses strict `<`: entries landing exactly on `now_ms` are
    /// left for the next tick. Entries are removed one at a time before
    /// `f` runs, so the callback may freely arm or cancel other timeouts
    /// (including rearming the one that just fired).
    pub fn process<F: FnMut(T)>(&self, now_ms: u64, mut f: F) {
        loop {
            let token = {
                let mut heap = self.heap.lock().expect("timeout heap poisoned");
                let expired =
                    heap.top().map(|record| record.expiration_ms < now_ms).unwrap_or(false);
                if expired {
                    heap.pop().map(|record| record.token)
                } else {
                    None
                }
            };
            match token {
                Some(token) => f(token),
                None => return,
            }
        }
    }

    /// Creates an unarmed handle bound to this scheduler.
    pub fn handle(&self) -> TimeoutHandle<T> {
        TimeoutHandle { scheduler: self.clone(), key: None }
    }
}

impl<T> Default for TimeoutScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one pending (or inactive) timeout on a scheduler.
///
/// If the handle is dropped or cleared, the token is guaranteed not to be
/// delivered in the future.
pub struct TimeoutHandle<T> {
    scheduler: TimeoutScheduler<T>,
    key: Option<NodeKey>,
}

impl<T> std::fmt::Debug for TimeoutHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle").field("armed", &self.key.is_some()).finish()
    }
}

impl<T> TimeoutHandle<T> {
    /// Timeout is still pending in the queue.
    pub fn is_active(&self) -> bool {
        match self.key {
            Some(key) => self.scheduler.heap.lock().expect("timeout heap poisoned").contains(key),
            None => false,
        }
    }

    /// Cancels the pending timeout, if any.
    pub fn clear_timeout(&mut self) {
        if let Some(key) = self.key.take() {
            self.scheduler.heap.lock().expect("timeout heap poisoned").remove(key);
        }
    }

    /// Arms (or rearms) this timeout. Any previous timeout is cancelled.
    pub fn set_timeout(&mut self, now_ms: u64, delay_ms: u64, token: T) {
        let mut heap = self.scheduler.heap.lock().expect("timeout heap poisoned");
        if let Some(key) = self.key.take() {
            heap.remove(key);
        }
        let key = heap.insert(TimeoutRecord { expiration_ms: now_ms + delay_ms, token });
        self.key = Some(key);
    }
}

impl<T> Drop for TimeoutHandle<T> {
    fn drop(&mut self) {
        self.clear_timeout();
    }
}
