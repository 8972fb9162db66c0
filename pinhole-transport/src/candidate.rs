//! Transport-address candidates and candidate pairs (RFC 5245 shapes,
//! trimmed to the IPv4 single-component case this library supports).

use std::fmt;
use std::net::SocketAddrV4;
use tracing::warn;

/// Candidate types ordered by type preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Local interface address.
    Host,
    /// Address observed by a STUN server.
    ServerReflexive,
    /// Address learned from an incoming connectivity check.
    PeerReflexive,
    /// Address allocated on a TURN relay.
    Relay,
}

impl CandidateKind {
    /// RFC 5245 type preference.
    pub fn preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relay => 0,
        }
    }
}

/// A transport address proposed as one end of a peer-to-peer path.
/// Immutable once admitted to a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddrV4,
    pub priority: u32,
    /// Base address for non-host candidates.
    pub base: Option<SocketAddrV4>,
}

impl Candidate {
    pub fn host(addr: SocketAddrV4, ifindex: u32) -> Self {
        let local_pref = 65535u32.saturating_sub(ifindex);
        Self {
            kind: CandidateKind::Host,
            addr,
            priority: (126 << 24) | (local_pref << 8) | 255,
            base: None,
        }
    }

    pub fn server_reflexive(addr: SocketAddrV4, base: SocketAddrV4) -> Self {
        Self {
            kind: CandidateKind::ServerReflexive,
            addr,
            priority: priority_for(CandidateKind::ServerReflexive, 65535),
            base: Some(base),
        }
    }

    pub fn peer_reflexive(addr: SocketAddrV4) -> Self {
        Self {
            kind: CandidateKind::PeerReflexive,
            addr,
            priority: priority_for(CandidateKind::PeerReflexive, 65535),
            base: None,
        }
    }

    pub fn relay(addr: SocketAddrV4, base: SocketAddrV4) -> Self {
        Self {
            kind: CandidateKind::Relay,
            addr,
            priority: priority_for(CandidateKind::Relay, 65535),
            base: Some(base),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.addr)
    }
}

/// `(type_pref << 24) | (local_pref << 8) | (256 - component)` with a single
/// component.
pub fn priority_for(kind: CandidateKind, local_pref: u32) -> u32 {
    (kind.preference() << 24) | ((local_pref & 0xFFFF) << 8) | (256 - 1)
}

/// Capacity of a candidate list; extra admissions are dropped with a warning.
pub const MAX_CANDIDATES: usize = 16;

/// Ordered, bounded candidate list with `(ip, port)` dedup.
#[derive(Debug, Default, Clone)]
pub struct CandidateList {
    items: Vec<Candidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Admit a candidate. Returns true when it was added; duplicates and
    /// overflow admissions return false.
    pub fn push(&mut self, cand: Candidate) -> bool {
        if self.items.iter().any(|c| c.addr == cand.addr) {
            return false;
        }
        if self.items.len() >= MAX_CANDIDATES {
            warn!(%cand, "candidate list full, dropping");
            return false;
        }
        self.items.push(cand);
        true
    }

    pub fn contains(&self, addr: SocketAddrV4) -> bool {
        self.items.iter().any(|c| c.addr == addr)
    }

    pub fn find(&self, addr: SocketAddrV4) -> Option<&Candidate> {
        self.items.iter().find(|c| c.addr == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first(&self) -> Option<&Candidate> {
        self.items.first()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Connectivity-check states of a candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// A (local, remote) pairing ordered by the RFC 8445 pair priority.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: PairState,
    pub nominated: bool,
    pub last_check_ms: u64,
    pub check_count: u32,
}

/// `(min(G,D) << 32) + (max(G,D) << 1) + (G > D ? 1 : 0)` where G is the
/// controlling side's candidate priority and D the controlled side's.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (g, d) = (controlling as u64, controlled as u64);
    (g.min(d) << 32) + (g.max(d) << 1) + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, last), port)
    }

    #[test]
    fn dedup_is_idempotent() {
        let mut list = CandidateList::new();
        assert!(list.push(Candidate::host(addr(1, 5000), 0)));
        assert!(!list.push(Candidate::host(addr(1, 5000), 0)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut list = CandidateList::new();
        for i in 0..MAX_CANDIDATES as u8 {
            assert!(list.push(Candidate::host(addr(i, 1000 + i as u16), 0)));
        }
        assert!(!list.push(Candidate::host(addr(200, 9), 0)));
        assert_eq!(list.len(), MAX_CANDIDATES);
    }

    #[test]
    fn type_preferences_order_candidates() {
        let host = Candidate::host(addr(1, 1), 0);
        let srflx = Candidate::server_reflexive(addr(2, 2), addr(1, 1));
        let prflx = Candidate::peer_reflexive(addr(3, 3));
        let relay = Candidate::relay(addr(4, 4), addr(1, 1));
        assert!(host.priority > prflx.priority);
        assert!(prflx.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
    }

    #[test]
    fn pair_priority_tiebreak() {
        // Same pair seen from both roles must order identically except for
        // the controlling bit.
        let a = pair_priority(100, 200);
        let b = pair_priority(200, 100);
        assert_eq!(a >> 1, b >> 1);
        assert_eq!(a & 1, 0);
        assert_eq!(b & 1, 1);
    }
}
