use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

/// Fixed-width peer identifier carried on the wire in signaling messages.
///
/// Identifiers shorter than 32 bytes are zero padded; longer ones are
/// truncated. Comparison ignores trailing padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub const LEN: usize = 32;

    /// Build an id from an arbitrary byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; Self::LEN];
        let n = bytes.len().min(Self::LEN);
        id[..n].copy_from_slice(&bytes[..n]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True when every byte is zero (the "no peer" value used by passive
    /// sessions before the remote identity is learned).
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// UTF-8 view of the id with trailing padding stripped.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(Self::LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(s.as_bytes()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.as_str())
    }
}

/// Millisecond-precision wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampMs(pub u64);

impl TimestampMs {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(now.as_millis() as u64)
    }

    pub fn saturating_elapsed(&self) -> u64 {
        TimestampMs::now().0.saturating_sub(self.0)
    }
}

impl From<u64> for TimestampMs {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, `connect` not yet called.
    Idle,
    /// Signaling in progress: registering, exchanging candidates.
    Registering,
    /// Candidates known, hole punching in progress.
    Punching,
    /// A direct path carries data.
    Connected,
    /// The server-relay fallback carries data.
    Relay,
    /// Explicit close requested, FIN emitted.
    Closing,
    /// Terminal clean shutdown.
    Closed,
    /// Terminal failure.
    Error,
}

impl SessionState {
    /// True for the two states in which application data may flow.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Relay)
    }
}

/// Which path currently carries application data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PathKind {
    #[default]
    None,
    /// Hole-punched direct path.
    Punch,
    /// Same-subnet shortcut to the peer's host address.
    Lan,
    /// Server relay.
    Relay,
}

/// Result of the reduced single-server NAT classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NatKind {
    #[default]
    Unknown,
    /// Local address is publicly reachable.
    Open,
    /// Mapping is endpoint independent. The three cone sub-types cannot be
    /// told apart with a single server address.
    Cone,
    /// Mapping differs per destination.
    Symmetric,
    /// Probe timed out; the server does not support classification.
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip() {
        let id = PeerId::from("alice");
        assert_eq!(id.as_str(), "alice");
        assert_eq!(format!("{id}"), "alice");
        assert!(!id.is_empty());
        assert!(PeerId::from_bytes(&[]).is_empty());
    }

    #[test]
    fn peer_id_truncates_long_input() {
        let long = "x".repeat(64);
        let id = PeerId::from(long.as_str());
        assert_eq!(id.as_str().len(), 32);
    }

    #[test]
    fn ready_states() {
        assert!(SessionState::Connected.is_ready());
        assert!(SessionState::Relay.is_ready());
        assert!(!SessionState::Punching.is_ready());
    }
}
