#![warn(missing_docs)]

//! tightbeam-util: ordered containers backing the protocol timers.
//!
//! - [`BinHeap`]: a min-heap that supports removing arbitrary live entries
//!   in O(log n), used wherever a plain `std::collections::BinaryHeap`
//!   would force an O(n) cancellation.
//! - [`TimeoutScheduler`] / [`TimeoutHandle`]: a deadline queue built on
//!   the heap. Handles own their pending entry; dropping a handle
//!   guarantees the entry is never delivered.

mod binheap;
mod timeout_queue;

pub use binheap::{BinHeap, NodeKey};
pub use timeout_queue::{TimeoutHandle, TimeoutScheduler};
