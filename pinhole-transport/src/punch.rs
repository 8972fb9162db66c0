//! UDP hole-punch engine: coordinated PUNCH/PUNCH_ACK probing over the
//! remote candidate list, followed by a PING/PONG heartbeat on the chosen
//! address and periodic direct-path recovery while relayed.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use tracing::{debug, info, trace};

use pinhole_core::{Error, Result};

use crate::candidate::CandidateList;
use crate::packet::PacketType;

/// Re-punch a candidate that has been quiet for this long.
pub const PUNCH_INTERVAL_MS: u64 = 500;
/// Give up direct punching and fall back to relay after this long.
pub const PUNCH_TIMEOUT_MS: u64 = 5_000;
/// Heartbeat PING when the path has been idle this long.
pub const PING_INTERVAL_MS: u64 = 15_000;
/// Declare the peer gone after this long without any inbound traffic.
pub const PONG_TIMEOUT_MS: u64 = 30_000;

/// Recovery probes while relayed fire every `4 * PUNCH_INTERVAL_MS`.
const RECOVERY_INTERVAL_MS: u64 = 4 * PUNCH_INTERVAL_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    Init,
    Punching,
    Connected,
    Relay,
}

/// State changes the orchestrator must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchEvent {
    /// A direct path answered; carry data to this address.
    Connected(SocketAddrV4),
    /// Punching timed out; switch to the server relay.
    RelayFallback,
    /// Heartbeat lost after the path had been up.
    Disconnected,
}

/// Hole-punch state machine. Packet emission goes through the supplied
/// callback so the session keeps socket ownership.
pub struct NatPunch {
    state: PunchState,
    peer_addr: Option<SocketAddrV4>,
    punch_start_ms: u64,
    connect_elapsed_ms: Option<u64>,
    last_punch_ms: HashMap<SocketAddrV4, u64>,
    last_send_ms: u64,
    last_recv_ms: u64,
    last_recovery_ms: u64,
    verbose: bool,
}

impl NatPunch {
    pub fn new(verbose: bool) -> Self {
        Self {
            state: PunchState::Init,
            peer_addr: None,
            punch_start_ms: 0,
            connect_elapsed_ms: None,
            last_punch_ms: HashMap::new(),
            last_send_ms: 0,
            last_recv_ms: 0,
            last_recovery_ms: 0,
            verbose,
        }
    }

    pub fn state(&self) -> PunchState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.peer_addr
    }

    /// Milliseconds from first punch to the first PUNCH_ACK.
    pub fn connect_elapsed_ms(&self) -> Option<u64> {
        self.connect_elapsed_ms
    }

    /// Batch start: punch every known remote candidate in parallel.
    pub fn start(
        &mut self,
        remotes: &CandidateList,
        now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) -> Result<()> {
        let first = remotes
            .first()
            .ok_or_else(|| Error::protocol("no remote candidates to punch"))?;
        self.peer_addr = Some(first.addr);
        self.state = PunchState::Punching;
        self.punch_start_ms = now_ms;
        self.last_recv_ms = now_ms;
        for cand in remotes.iter() {
            self.send_punch(cand.addr, now_ms, &mut emit);
        }
        Ok(())
    }

    /// Trickle entry point: a candidate arrived while punching is already
    /// underway. Ignored once connected.
    pub fn trickle(
        &mut self,
        addr: SocketAddrV4,
        now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) {
        if self.state == PunchState::Connected {
            return;
        }
        if self.state == PunchState::Init {
            self.state = PunchState::Punching;
            self.punch_start_ms = now_ms;
            self.last_recv_ms = now_ms;
        }
        self.send_punch(addr, now_ms, &mut emit);
    }

    /// Incoming PUNCH: answer it and treat it as proof of a working path.
    pub fn on_punch(
        &mut self,
        from: SocketAddrV4,
        now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) -> Option<PunchEvent> {
        emit(from, PacketType::PunchAck);
        self.last_send_ms = now_ms;
        self.on_punch_ack(from, now_ms)
    }

    /// Incoming PUNCH_ACK: the path to `from` works.
    pub fn on_punch_ack(&mut self, from: SocketAddrV4, now_ms: u64) -> Option<PunchEvent> {
        self.last_recv_ms = now_ms;
        match self.state {
            PunchState::Connected => None,
            PunchState::Init | PunchState::Punching | PunchState::Relay => {
                self.peer_addr = Some(from);
                self.state = PunchState::Connected;
                let elapsed = now_ms.saturating_sub(self.punch_start_ms);
                self.connect_elapsed_ms = Some(elapsed);
                info!(%from, elapsed_ms = elapsed, "nat punch succeeded");
                Some(PunchEvent::Connected(from))
            }
        }
    }

    pub fn on_ping(
        &mut self,
        from: SocketAddrV4,
        now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) {
        self.last_recv_ms = now_ms;
        emit(from, PacketType::Pong);
        self.last_send_ms = now_ms;
    }

    pub fn on_pong(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
    }

    /// Record outbound data on the active path (suppresses PINGs).
    pub fn note_send(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    /// Record inbound data on the active path (feeds the liveness check).
    pub fn note_recv(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
    }

    /// Periodic work: re-punch stale candidates, heartbeat, recovery.
    pub fn tick(
        &mut self,
        now_ms: u64,
        remotes: &CandidateList,
        mut emit: impl FnMut(SocketAddrV4, PacketType),
    ) -> Option<PunchEvent> {
        match self.state {
            PunchState::Init => None,
            PunchState::Punching => {
                if now_ms.saturating_sub(self.punch_start_ms) >= PUNCH_TIMEOUT_MS {
                    debug!("punch timeout, falling back to relay");
                    self.state = PunchState::Relay;
                    self.last_recovery_ms = now_ms;
                    return Some(PunchEvent::RelayFallback);
                }
                for cand in remotes.iter() {
                    let last = self.last_punch_ms.get(&cand.addr).copied().unwrap_or(0);
                    if now_ms.saturating_sub(last) >= PUNCH_INTERVAL_MS {
                        self.send_punch(cand.addr, now_ms, &mut emit);
                    }
                }
                None
            }
            PunchState::Connected => {
                if now_ms.saturating_sub(self.last_recv_ms) >= PONG_TIMEOUT_MS {
                    debug!("pong timeout, peer unreachable");
                    return Some(PunchEvent::Disconnected);
                }
                if now_ms.saturating_sub(self.last_send_ms) >= PING_INTERVAL_MS {
                    if let Some(addr) = self.peer_addr {
                        emit(addr, PacketType::Ping);
                        self.last_send_ms = now_ms;
                    }
                }
                None
            }
            PunchState::Relay => {
                if now_ms.saturating_sub(self.last_recovery_ms) >= RECOVERY_INTERVAL_MS {
                    self.last_recovery_ms = now_ms;
                    for cand in remotes.iter() {
                        self.send_punch(cand.addr, now_ms, &mut emit);
                    }
                }
                None
            }
        }
    }

    fn send_punch(
        &mut self,
        addr: SocketAddrV4,
        now_ms: u64,
        emit: &mut impl FnMut(SocketAddrV4, PacketType),
    ) {
        if self.verbose {
            debug!(%addr, "punch");
        } else {
            trace!(%addr, "punch");
        }
        emit(addr, PacketType::Punch);
        self.last_punch_ms.insert(addr, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use std::net::Ipv4Addr;

    fn remotes(n: u8) -> CandidateList {
        let mut list = CandidateList::new();
        for i in 0..n {
            list.push(Candidate::host(
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i + 1), 4000 + i as u16),
                0,
            ));
        }
        list
    }

    #[test]
    fn batch_start_punches_every_candidate() {
        let mut punch = NatPunch::new(false);
        let list = remotes(3);
        let mut sent = Vec::new();
        punch.start(&list, 0, |a, t| sent.push((a, t))).unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, t)| *t == PacketType::Punch));
        assert_eq!(punch.state(), PunchState::Punching);
    }

    #[test]
    fn start_requires_a_candidate() {
        let mut punch = NatPunch::new(false);
        assert!(punch.start(&CandidateList::new(), 0, |_, _| {}).is_err());
    }

    #[test]
    fn punch_ack_connects_and_pins_address() {
        let mut punch = NatPunch::new(false);
        let list = remotes(2);
        punch.start(&list, 0, |_, _| {}).unwrap();

        let winner = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 4001);
        let ev = punch.on_punch_ack(winner, 120);
        assert_eq!(ev, Some(PunchEvent::Connected(winner)));
        assert_eq!(punch.peer_addr(), Some(winner));
        assert_eq!(punch.connect_elapsed_ms(), Some(120));

        // A later ack from another candidate must not steal the path.
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000);
        assert_eq!(punch.on_punch_ack(other, 130), None);
        assert_eq!(punch.peer_addr(), Some(winner));
    }

    #[test]
    fn incoming_punch_is_answered() {
        let mut punch = NatPunch::new(false);
        let from = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 9999);
        let mut sent = Vec::new();
        let ev = punch.on_punch(from, 50, |a, t| sent.push((a, t)));
        assert_eq!(sent, vec![(from, PacketType::PunchAck)]);
        assert_eq!(ev, Some(PunchEvent::Connected(from)));
    }

    #[test]
    fn timeout_falls_back_to_relay() {
        let mut punch = NatPunch::new(false);
        let list = remotes(1);
        punch.start(&list, 0, |_, _| {}).unwrap();
        assert_eq!(punch.tick(4_999, &list, |_, _| {}), None);
        assert_eq!(
            punch.tick(PUNCH_TIMEOUT_MS, &list, |_, _| {}),
            Some(PunchEvent::RelayFallback)
        );
        assert_eq!(punch.state(), PunchState::Relay);
    }

    #[test]
    fn interval_repunches_stale_candidates() {
        let mut punch = NatPunch::new(false);
        let list = remotes(2);
        punch.start(&list, 0, |_, _| {}).unwrap();

        let mut sent = 0;
        punch.tick(100, &list, |_, _| sent += 1);
        assert_eq!(sent, 0);
        punch.tick(PUNCH_INTERVAL_MS, &list, |_, _| sent += 1);
        assert_eq!(sent, 2);
    }

    #[test]
    fn heartbeat_ping_and_loss() {
        let mut punch = NatPunch::new(false);
        let list = remotes(1);
        punch.start(&list, 0, |_, _| {}).unwrap();
        punch.on_punch_ack(list.first().unwrap().addr, 10);

        let mut sent = Vec::new();
        punch.tick(10 + PING_INTERVAL_MS, &list, |a, t| sent.push((a, t)));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, PacketType::Ping);

        let ev = punch.tick(10 + PONG_TIMEOUT_MS, &list, |_, _| {});
        assert_eq!(ev, Some(PunchEvent::Disconnected));
    }

    #[test]
    fn relay_mode_probes_for_recovery() {
        let mut punch = NatPunch::new(false);
        let list = remotes(1);
        punch.start(&list, 0, |_, _| {}).unwrap();
        punch.tick(PUNCH_TIMEOUT_MS, &list, |_, _| {});

        let mut sent = 0;
        punch.tick(PUNCH_TIMEOUT_MS + RECOVERY_INTERVAL_MS, &list, |_, _| {
            sent += 1
        });
        assert_eq!(sent, 1);

        // Recovery ack promotes back to a direct path.
        let ev = punch.on_punch_ack(list.first().unwrap().addr, 8_000);
        assert!(matches!(ev, Some(PunchEvent::Connected(_))));
    }
}
