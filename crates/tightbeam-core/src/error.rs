use std::{fmt, io, net::SocketAddr};

use crate::SessionId;

/// Errors surfaced by the public connection API.
#[derive(Debug)]
pub enum ErrorKind {
    /// Wrapper around a `std::io::Error`.
    Io(io::Error),
    /// Binding the UDP socket failed.
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// Channel index outside `0..CHANNEL_COUNT`.
    InvalidChannel(u8),
    /// No peer registered under the given session id.
    UnknownPeer(SessionId),
    /// Operation requires an established connection.
    NotConnected,
    /// `serve`/`connect` was called on a connection whose workers are
    /// already running.
    AlreadyStarted,
    /// The connection is shutting down and no longer accepts commands.
    ShuttingDown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Bind { addr, source } => write!(f, "could not bind {}: {}", addr, source),
            Self::InvalidChannel(ch) => write!(f, "invalid channel {}", ch),
            Self::UnknownPeer(id) => write!(f, "no peer with id {}", id),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyStarted => write!(f, "connection already started"),
            Self::ShuttingDown => write!(f, "connection is shutting down"),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, ErrorKind>;
