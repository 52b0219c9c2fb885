use std::fmt;

use rand::Rng;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Short hex identifier attached to every parsed datagram so that all log
/// lines about one datagram can be correlated.
///
/// Generated from the thread-local generator; quality suffices for log
/// correlation only, never for anything security-sensitive.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketUuid([u8; 16]);

impl PacketUuid {
    /// Generates a fresh id.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut chars = [0u8; 16];
        for c in chars.iter_mut() {
            *c = HEX_CHARS[rng.random_range(0..16usize)];
        }
        Self(chars)
    }

    /// The id as a 16-character hex string.
    pub fn as_str(&self) -> &str {
        // Always built from HEX_CHARS, so valid UTF-8.
        std::str::from_utf8(&self.0).unwrap_or("????????????????")
    }
}

impl fmt::Display for PacketUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PacketUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketUuid({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let id = PacketUuid::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 16);
        assert!(s.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_differ() {
        // 64 bits of randomness; a collision here means the generator is
        // broken, not unlucky.
        let a = PacketUuid::generate();
        let b = PacketUuid::generate();
        assert_ne!(a, b);
    }
}
