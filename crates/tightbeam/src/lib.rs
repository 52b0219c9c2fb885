#![warn(missing_docs)]

//! Tightbeam: a small public API facade for the workspace.
//!
//! This crate re-exports the surface needed to build apps on the
//! reliable UDP transport:
//!
//! - Connection, commands and events (`Connection`, `ConnectionEvent`)
//! - Configuration (`Config`)
//! - Statistic selectors (`RttStat`, `RateStat`)
//!
//! Example
//! ```no_run
//! use std::time::Duration;
//! use tightbeam::{Config, Connection, ConnectionEvent};
//!
//! let mut server = Connection::new(Config::default());
//! server.serve("127.0.0.1:30010".parse().unwrap()).unwrap();
//!
//! let mut client = Connection::new(Config::default());
//! client.connect(server.local_addr().unwrap()).unwrap();
//!
//! // The server sees the new peer and can talk to it.
//! if let Some(ConnectionEvent::PeerAdded { peer_id, .. }) =
//!     server.wait_event(Duration::from_secs(1))
//! {
//!     server.send(peer_id, 0, b"welcome".to_vec(), true).unwrap();
//! }
//! ```

pub use tightbeam_conn::{Connection, ConnectionCommand, ConnectionEvent, PeerHandler};
pub use tightbeam_core::{
    config::Config,
    error::{ErrorKind, Result},
    SeqNum, SessionId,
};
pub use tightbeam_peer::{RateStat, RttStat};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, Connection, ConnectionEvent, ErrorKind, PeerHandler, RateStat, Result, RttStat,
        SessionId,
    };
}
