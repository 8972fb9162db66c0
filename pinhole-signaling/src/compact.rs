//! Compact signaling: a stateful UDP protocol on the session's own data
//! socket. Registration retries, server-minted session ids, a bitmap-acked
//! candidate batch exchange, keep-alives and the NAT probe all live here;
//! the session only routes packets in and sends what `emit` produces.

use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

use pinhole_core::PeerId;
use pinhole_transport::candidate::priority_for;
use pinhole_transport::packet::{PacketHeader, HDR_FLAG_FIN, HDR_FLAG_RELAY_SUPPORT};
use pinhole_transport::{Candidate, CandidateKind, CandidateList, PacketType};

use crate::SignalEvent;

const REGISTER_INTERVAL_MS: u64 = 1_000;
const REGISTER_MAX_ATTEMPTS: u32 = 10;
const BATCH_INTERVAL_MS: u64 = 500;
const ALIVE_INTERVAL_MS: u64 = 20_000;
const PROBE_INTERVAL_MS: u64 = 1_000;
const PROBE_MAX_ATTEMPTS: u32 = 3;
/// Candidate batches use seq 1..=16; the bitmap has one bit per seq.
const MAX_BATCHES: usize = 16;
/// Candidates per PEER_INFO batch.
const BATCH_CANDS: usize = 4;

/// Compact protocol lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactState {
    Init,
    Registering,
    Registered,
    Ice,
    Ready,
}

/// One candidate in the 7-byte compact encoding
/// `[type:u8, ip:4B network order, port:u16be]`.
fn put_compact_candidate(buf: &mut Vec<u8>, cand: &Candidate) {
    let kind = match cand.kind {
        CandidateKind::Host => 0u8,
        CandidateKind::ServerReflexive => 1,
        CandidateKind::PeerReflexive => 2,
        CandidateKind::Relay => 3,
    };
    buf.push(kind);
    buf.extend_from_slice(&cand.addr.ip().octets());
    buf.put_u16(cand.addr.port());
}

fn get_compact_candidate(cursor: &mut &[u8]) -> Option<Candidate> {
    if cursor.len() < 7 {
        return None;
    }
    let kind = match cursor.get_u8() {
        0 => CandidateKind::Host,
        1 => CandidateKind::ServerReflexive,
        2 => CandidateKind::PeerReflexive,
        3 => CandidateKind::Relay,
        _ => return None,
    };
    let mut octets = [0u8; 4];
    cursor.copy_to_slice(&mut octets);
    let port = cursor.get_u16();
    Some(Candidate {
        kind,
        addr: SocketAddrV4::new(Ipv4Addr::from(octets), port),
        priority: priority_for(kind, 65535),
        base: None,
    })
}

struct OutBatch {
    seq: u16,
    payload: Vec<u8>,
    fin: bool,
    last_send_ms: u64,
}

/// Compact signaling context for one session.
pub struct CompactSignaling {
    server: SocketAddrV4,
    local_id: PeerId,
    remote_id: PeerId,
    state: CompactState,

    register_payload: Vec<u8>,
    register_attempts: u32,
    last_register_ms: u64,
    got_register_ack: bool,
    sent_in_register: Vec<SocketAddrV4>,

    session_id: Option<u64>,
    peer_online: bool,
    relay_support: bool,
    candidates_cached: u8,

    probe_port: u16,
    skip_nat_probe: bool,
    probe_attempts: u32,
    last_probe_ms: u64,
    probe_done: bool,

    batches: Vec<OutBatch>,
    candidates_mask: u16,
    candidates_acked_mask: u16,

    last_alive_ms: u64,
}

impl CompactSignaling {
    pub fn new(
        server: SocketAddrV4,
        local_id: PeerId,
        remote_id: Option<PeerId>,
        skip_nat_probe: bool,
    ) -> Self {
        Self {
            server,
            local_id,
            remote_id: remote_id.unwrap_or(PeerId([0u8; 32])),
            state: CompactState::Init,
            register_payload: Vec::new(),
            register_attempts: 0,
            last_register_ms: 0,
            got_register_ack: false,
            sent_in_register: Vec::new(),
            session_id: None,
            peer_online: false,
            relay_support: false,
            candidates_cached: 0,
            probe_port: 0,
            skip_nat_probe,
            probe_attempts: 0,
            last_probe_ms: 0,
            probe_done: skip_nat_probe,
            batches: Vec::new(),
            candidates_mask: 0,
            candidates_acked_mask: 0,
            last_alive_ms: 0,
        }
    }

    pub fn state(&self) -> CompactState {
        self.state
    }

    pub fn server_addr(&self) -> SocketAddrV4 {
        self.server
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn relay_support(&self) -> bool {
        self.relay_support
    }

    pub fn peer_online(&self) -> bool {
        self.peer_online
    }

    /// How many of our candidates the server already cached at REGISTER
    /// time.
    pub fn candidates_cached(&self) -> u8 {
        self.candidates_cached
    }

    /// Build and send the initial REGISTER carrying the candidates known so
    /// far (the rest follow as PEER_INFO batches once ICE entry happens).
    pub fn start(
        &mut self,
        locals: &CandidateList,
        now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) {
        let mut payload = Vec::with_capacity(65 + locals.len() * 7);
        payload.extend_from_slice(self.local_id.as_bytes());
        payload.extend_from_slice(self.remote_id.as_bytes());
        payload.push(locals.len() as u8);
        for cand in locals.iter() {
            put_compact_candidate(&mut payload, cand);
            self.sent_in_register.push(cand.addr);
        }
        self.register_payload = payload;
        self.state = CompactState::Registering;
        self.register_attempts = 1;
        self.last_register_ms = now_ms;
        emit(
            self.server,
            PacketType::Register,
            0,
            0,
            &self.register_payload,
        );
    }

    /// Dispatch one decoded packet belonging to this variant.
    pub fn on_packet(
        &mut self,
        hdr: &PacketHeader,
        payload: &[u8],
        _now_ms: u64,
        mut emit: impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        match hdr.ptype {
            PacketType::RegisterAck => {
                if payload.len() < 10 {
                    warn!("short REGISTER_ACK");
                    return events;
                }
                let mut cursor = payload;
                let status = cursor.get_u8();
                self.candidates_cached = cursor.get_u8();
                let mut octets = [0u8; 4];
                cursor.copy_to_slice(&mut octets);
                let public = SocketAddrV4::new(Ipv4Addr::from(octets), cursor.get_u16());
                self.probe_port = cursor.get_u16();
                self.peer_online = status == 1;
                self.relay_support = hdr.flags & HDR_FLAG_RELAY_SUPPORT != 0;
                if !self.got_register_ack {
                    debug!(%public, status, probe_port = self.probe_port, "registered");
                    events.push(SignalEvent::PublicAddr(public));
                }
                self.got_register_ack = true;
                if self.state == CompactState::Registering {
                    self.state = CompactState::Registered;
                }
            }
            PacketType::PeerInfo => {
                events.extend(self.on_peer_info(hdr, payload, &mut emit));
            }
            PacketType::PeerInfoAck => {
                if payload.len() < 8 {
                    return events;
                }
                let mut cursor = payload;
                let sid = cursor.get_u64();
                if Some(sid) != self.session_id {
                    return events;
                }
                if (1..=MAX_BATCHES as u16).contains(&hdr.seq) {
                    self.candidates_acked_mask |= 1 << (hdr.seq - 1);
                }
                if self.state == CompactState::Ice
                    && self.candidates_acked_mask & self.candidates_mask == self.candidates_mask
                {
                    debug!("candidate batches delivered");
                    self.state = CompactState::Ready;
                }
            }
            PacketType::Alive => {
                emit(self.server, PacketType::AliveAck, 0, hdr.seq, &[]);
            }
            PacketType::AliveAck => {}
            PacketType::NatProbeAck => {
                if self.probe_done || payload.len() < 6 {
                    return events;
                }
                let mut cursor = payload;
                let mut octets = [0u8; 4];
                cursor.copy_to_slice(&mut octets);
                let mapped = SocketAddrV4::new(Ipv4Addr::from(octets), cursor.get_u16());
                self.probe_done = true;
                events.push(SignalEvent::NatProbeResult(Some(mapped)));
            }
            PacketType::PeerOff => {
                debug!("peer went offline");
                self.session_id = None;
                self.batches.clear();
                self.candidates_mask = 0;
                self.candidates_acked_mask = 0;
                if matches!(self.state, CompactState::Ice | CompactState::Ready) {
                    self.state = CompactState::Registered;
                }
                events.push(SignalEvent::PeerOffline);
            }
            PacketType::RelayData => {
                if !self.relay_support || payload.len() < 10 {
                    return events;
                }
                let mut cursor = payload;
                let sid = cursor.get_u64();
                if Some(sid) != self.session_id {
                    return events;
                }
                let len = cursor.get_u16() as usize;
                if cursor.len() < len {
                    return events;
                }
                events.push(SignalEvent::RelayData {
                    seq: hdr.seq,
                    data: cursor[..len].to_vec(),
                });
            }
            PacketType::RelayAck => {
                if payload.len() < 14 {
                    return events;
                }
                let mut cursor = payload;
                let sid = cursor.get_u64();
                if Some(sid) != self.session_id {
                    return events;
                }
                let ack_seq = cursor.get_u16();
                let sack_bits = cursor.get_u32();
                events.push(SignalEvent::RelayAck { ack_seq, sack_bits });
            }
            other => {
                warn!(?other, "unexpected packet for compact signaling");
            }
        }
        events
    }

    fn on_peer_info(
        &mut self,
        hdr: &PacketHeader,
        payload: &[u8],
        emit: &mut impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        if payload.len() < 10 {
            warn!("short PEER_INFO");
            return events;
        }
        let mut cursor = payload;
        let sid = cursor.get_u64();
        let base_index = cursor.get_u8();
        let count = cursor.get_u8() as usize;

        if hdr.seq == 0 {
            if base_index != 0 {
                // A server-minted batch must start the set; anything else
                // has no defined merge rule.
                warn!(base_index, "seq 0 PEER_INFO with nonzero base, dropped");
                return events;
            }
            if self.session_id.is_none() {
                debug!(session_id = sid, "session id adopted");
            }
            self.session_id = Some(sid);
        } else if self.session_id != Some(sid) {
            warn!(got = sid, "PEER_INFO for unknown session id");
            return events;
        }

        for _ in 0..count {
            match get_compact_candidate(&mut cursor) {
                Some(cand) => events.push(SignalEvent::RemoteCandidate(cand)),
                None => {
                    warn!("truncated PEER_INFO batch");
                    break;
                }
            }
        }
        if hdr.flags & HDR_FLAG_FIN != 0 {
            events.push(SignalEvent::RemoteCandidatesDone);
        }

        let mut ack = Vec::with_capacity(8);
        ack.put_u64(sid);
        emit(self.server, PacketType::PeerInfoAck, 0, hdr.seq, &ack);
        events
    }

    /// Periodic work: REGISTER retries, ICE-entry batch construction, batch
    /// retransmits, NAT probe and keep-alive.
    pub fn tick(
        &mut self,
        now_ms: u64,
        locals: &CandidateList,
        mut emit: impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        match self.state {
            CompactState::Init => {}
            CompactState::Registering => {
                if now_ms.saturating_sub(self.last_register_ms) >= REGISTER_INTERVAL_MS {
                    if self.register_attempts >= REGISTER_MAX_ATTEMPTS {
                        events.push(SignalEvent::SignalingFailed(
                            "register retries exhausted".into(),
                        ));
                    } else {
                        self.register_attempts += 1;
                        self.last_register_ms = now_ms;
                        emit(
                            self.server,
                            PacketType::Register,
                            0,
                            0,
                            &self.register_payload,
                        );
                    }
                }
            }
            CompactState::Registered => {
                // Transition to ICE needs both the REGISTER_ACK and a
                // server-minted session id, in either order.
                if self.got_register_ack && self.session_id.is_some() {
                    self.enter_ice(locals, now_ms, &mut emit);
                }
                self.keep_alive(now_ms, &mut emit);
            }
            CompactState::Ice => {
                for batch in &mut self.batches {
                    let bit = 1u16 << (batch.seq - 1);
                    if self.candidates_acked_mask & bit != 0 {
                        continue;
                    }
                    if now_ms.saturating_sub(batch.last_send_ms) >= BATCH_INTERVAL_MS {
                        batch.last_send_ms = now_ms;
                        let flags = if batch.fin { HDR_FLAG_FIN } else { 0 };
                        emit(
                            self.server,
                            PacketType::PeerInfo,
                            flags,
                            batch.seq,
                            &batch.payload,
                        );
                    }
                }
                self.keep_alive(now_ms, &mut emit);
            }
            CompactState::Ready => {
                self.keep_alive(now_ms, &mut emit);
            }
        }
        events.extend(self.tick_probe(now_ms, &mut emit));
        events
    }

    fn keep_alive(
        &mut self,
        now_ms: u64,
        emit: &mut impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) {
        if now_ms.saturating_sub(self.last_alive_ms) >= ALIVE_INTERVAL_MS {
            self.last_alive_ms = now_ms;
            emit(self.server, PacketType::Alive, 0, 0, &[]);
        }
    }

    fn tick_probe(
        &mut self,
        now_ms: u64,
        emit: &mut impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        if self.probe_done || self.probe_port == 0 || !self.got_register_ack {
            return events;
        }
        if self.probe_attempts > 0
            && now_ms.saturating_sub(self.last_probe_ms) < PROBE_INTERVAL_MS
        {
            return events;
        }
        if self.probe_attempts >= PROBE_MAX_ATTEMPTS {
            self.probe_done = true;
            events.push(SignalEvent::NatProbeResult(None));
            return events;
        }
        let probe_addr = SocketAddrV4::new(*self.server.ip(), self.probe_port);
        emit(probe_addr, PacketType::NatProbe, 0, 0, &[]);
        self.probe_attempts += 1;
        self.last_probe_ms = now_ms;
        events
    }

    fn enter_ice(
        &mut self,
        locals: &CandidateList,
        now_ms: u64,
        emit: &mut impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]),
    ) {
        let Some(sid) = self.session_id else { return };
        let remainder: Vec<&Candidate> = locals
            .iter()
            .filter(|c| !self.sent_in_register.contains(&c.addr))
            .collect();

        self.batches.clear();
        self.candidates_mask = 0;
        self.candidates_acked_mask = 0;

        let chunk_count = if remainder.is_empty() {
            1 // an empty FIN batch closes the exchange
        } else {
            remainder.len().div_ceil(BATCH_CANDS).min(MAX_BATCHES)
        };
        for i in 0..chunk_count {
            let lo = (i * BATCH_CANDS).min(remainder.len());
            let hi = ((i + 1) * BATCH_CANDS).min(remainder.len());
            let chunk = &remainder[lo..hi];
            let seq = (i + 1) as u16;
            let mut payload = Vec::with_capacity(10 + chunk.len() * 7);
            payload.put_u64(sid);
            payload.push(0); // base index
            payload.push(chunk.len() as u8);
            for cand in chunk {
                put_compact_candidate(&mut payload, cand);
            }
            self.candidates_mask |= 1 << (seq - 1);
            self.batches.push(OutBatch {
                seq,
                payload,
                fin: i + 1 == chunk_count,
                last_send_ms: now_ms,
            });
        }
        debug!(batches = self.batches.len(), "entering ice exchange");
        self.state = CompactState::Ice;
        for batch in &self.batches {
            let flags = if batch.fin { HDR_FLAG_FIN } else { 0 };
            emit(
                self.server,
                PacketType::PeerInfo,
                flags,
                batch.seq,
                &batch.payload,
            );
        }
    }

    /// Wrap one reliable DATA payload for server relaying. Returns the
    /// packet payload, or `None` when relaying is unavailable.
    pub fn relay_wrap_data(&self, data: &[u8]) -> Option<Vec<u8>> {
        let sid = self.session_id?;
        if !self.relay_support {
            return None;
        }
        let mut payload = Vec::with_capacity(10 + data.len());
        payload.put_u64(sid);
        payload.put_u16(data.len() as u16);
        payload.extend_from_slice(data);
        Some(payload)
    }

    /// Wrap a reliable ACK for server relaying.
    pub fn relay_wrap_ack(&self, ack_seq: u16, sack_bits: u32) -> Option<Vec<u8>> {
        let sid = self.session_id?;
        if !self.relay_support {
            return None;
        }
        let mut payload = Vec::with_capacity(14);
        payload.put_u64(sid);
        payload.put_u16(ack_seq);
        payload.put_u32(sack_bits);
        Some(payload)
    }

    /// Graceful shutdown: tell the server we are gone.
    pub fn close(&mut self, mut emit: impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8])) {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(self.local_id.as_bytes());
        payload.extend_from_slice(self.remote_id.as_bytes());
        emit(self.server, PacketType::Unregister, 0, 0, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_transport::packet::PacketHeader;

    type Sent = Vec<(SocketAddrV4, PacketType, u8, u16, Vec<u8>)>;

    fn server() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 9000)
    }

    fn collect(sent: &mut Sent) -> impl FnMut(SocketAddrV4, PacketType, u8, u16, &[u8]) + '_ {
        |a, t, f, s, p| sent.push((a, t, f, s, p.to_vec()))
    }

    fn locals() -> CandidateList {
        let mut list = CandidateList::new();
        list.push(Candidate::host(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 5000),
            0,
        ));
        list
    }

    fn register_ack_payload(port: u16, probe_port: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(1); // peer online
        p.push(1); // cached
        p.extend_from_slice(&[203, 0, 113, 50]);
        p.put_u16(port);
        p.put_u16(probe_port);
        p
    }

    fn peer_info_payload(sid: u64, cands: &[Candidate]) -> Vec<u8> {
        let mut p = Vec::new();
        p.put_u64(sid);
        p.push(0);
        p.push(cands.len() as u8);
        for c in cands {
            put_compact_candidate(&mut p, c);
        }
        p
    }

    fn hdr(ptype: PacketType, flags: u8, seq: u16) -> PacketHeader {
        PacketHeader { ptype, flags, seq }
    }

    #[test]
    fn register_retries_then_fails() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, true);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, PacketType::Register);

        let mut now = 0;
        let mut failed = false;
        for _ in 0..12 {
            now += REGISTER_INTERVAL_MS;
            for ev in sig.tick(now, &locals(), collect(&mut sent)) {
                if matches!(ev, SignalEvent::SignalingFailed(_)) {
                    failed = true;
                }
            }
        }
        assert!(failed);
        let registers = sent
            .iter()
            .filter(|(_, t, ..)| *t == PacketType::Register)
            .count();
        assert_eq!(registers as u32, REGISTER_MAX_ATTEMPTS);
    }

    #[test]
    fn register_ack_then_session_id_enters_ice() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), Some(PeerId::from("b")), true);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));

        let events = sig.on_packet(
            &hdr(PacketType::RegisterAck, HDR_FLAG_RELAY_SUPPORT, 0),
            &register_ack_payload(40000, 9001),
            10,
            collect(&mut sent),
        );
        assert!(matches!(events[0], SignalEvent::PublicAddr(a) if a.port() == 40000));
        assert_eq!(sig.state(), CompactState::Registered);
        assert!(sig.relay_support());

        // Server-minted session id arrives with the first remote batch.
        let remote = Candidate::host(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6000), 0);
        let events = sig.on_packet(
            &hdr(PacketType::PeerInfo, 0, 0),
            &peer_info_payload(0x1122334455667788, &[remote]),
            20,
            collect(&mut sent),
        );
        assert!(matches!(events[0], SignalEvent::RemoteCandidate(_)));
        assert_eq!(sig.session_id(), Some(0x1122334455667788));
        // The batch was acked back to the server.
        assert!(sent
            .iter()
            .any(|(_, t, _, s, _)| *t == PacketType::PeerInfoAck && *s == 0));

        sent.clear();
        // Now the srflx candidate exists; ICE entry sends the remainder.
        let mut local_list = locals();
        local_list.push(Candidate::server_reflexive(
            SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 50), 40000),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 5000),
        ));
        sig.tick(30, &local_list, collect(&mut sent));
        assert_eq!(sig.state(), CompactState::Ice);
        let infos: Vec<_> = sent
            .iter()
            .filter(|(_, t, ..)| *t == PacketType::PeerInfo)
            .collect();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].2 & HDR_FLAG_FIN, HDR_FLAG_FIN);

        // Ack completes the exchange.
        let mut ack = Vec::new();
        ack.put_u64(0x1122334455667788u64);
        sig.on_packet(
            &hdr(PacketType::PeerInfoAck, 0, 1),
            &ack,
            40,
            collect(&mut sent),
        );
        assert_eq!(sig.state(), CompactState::Ready);
    }

    #[test]
    fn seq0_with_nonzero_base_is_dropped() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, true);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        let mut payload = peer_info_payload(7, &[]);
        payload[8] = 3; // base index
        let events = sig.on_packet(
            &hdr(PacketType::PeerInfo, 0, 0),
            &payload,
            10,
            collect(&mut sent),
        );
        assert!(events.is_empty());
        assert_eq!(sig.session_id(), None);
    }

    #[test]
    fn peer_off_resets_to_registered() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, true);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        sig.on_packet(
            &hdr(PacketType::RegisterAck, 0, 0),
            &register_ack_payload(1, 0),
            5,
            collect(&mut sent),
        );
        sig.on_packet(
            &hdr(PacketType::PeerInfo, 0, 0),
            &peer_info_payload(42, &[]),
            10,
            collect(&mut sent),
        );
        sig.tick(20, &locals(), collect(&mut sent));
        assert_eq!(sig.state(), CompactState::Ice);

        let mut off = Vec::new();
        off.put_u64(42u64);
        let events = sig.on_packet(
            &hdr(PacketType::PeerOff, 0, 0),
            &off,
            30,
            collect(&mut sent),
        );
        assert!(events.contains(&SignalEvent::PeerOffline));
        assert_eq!(sig.state(), CompactState::Registered);
        assert_eq!(sig.session_id(), None);
    }

    #[test]
    fn nat_probe_retries_then_reports_timeout() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, false);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        sig.on_packet(
            &hdr(PacketType::RegisterAck, 0, 0),
            &register_ack_payload(1, 9001),
            5,
            collect(&mut sent),
        );

        let mut events = Vec::new();
        for i in 0..5u64 {
            events.extend(sig.tick(10 + i * PROBE_INTERVAL_MS, &locals(), collect(&mut sent)));
        }
        let probes = sent
            .iter()
            .filter(|(a, t, ..)| *t == PacketType::NatProbe && a.port() == 9001)
            .count();
        assert_eq!(probes as u32, PROBE_MAX_ATTEMPTS);
        assert!(events.contains(&SignalEvent::NatProbeResult(None)));
    }

    #[test]
    fn nat_probe_ack_reports_mapping() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, false);
        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        sig.on_packet(
            &hdr(PacketType::RegisterAck, 0, 0),
            &register_ack_payload(50001, 9001),
            5,
            collect(&mut sent),
        );
        sig.tick(10, &locals(), collect(&mut sent));

        let mut payload = Vec::new();
        payload.extend_from_slice(&[203, 0, 113, 50]);
        payload.put_u16(50001u16);
        let events = sig.on_packet(
            &hdr(PacketType::NatProbeAck, 0, 0),
            &payload,
            20,
            collect(&mut sent),
        );
        assert!(
            matches!(events[0], SignalEvent::NatProbeResult(Some(a)) if a.port() == 50001)
        );
    }

    #[test]
    fn relay_wrapping_requires_session_and_support() {
        let mut sig = CompactSignaling::new(server(), PeerId::from("a"), None, true);
        assert!(sig.relay_wrap_data(b"x").is_none());

        let mut sent = Sent::new();
        sig.start(&locals(), 0, collect(&mut sent));
        sig.on_packet(
            &hdr(PacketType::RegisterAck, HDR_FLAG_RELAY_SUPPORT, 0),
            &register_ack_payload(1, 0),
            5,
            collect(&mut sent),
        );
        sig.on_packet(
            &hdr(PacketType::PeerInfo, 0, 0),
            &peer_info_payload(9, &[]),
            10,
            collect(&mut sent),
        );
        let wrapped = sig.relay_wrap_data(b"abc").unwrap();
        assert_eq!(&wrapped[..8], &9u64.to_be_bytes());
        assert_eq!(&wrapped[8..10], &3u16.to_be_bytes());
        assert_eq!(&wrapped[10..], b"abc");

        // And the inverse direction parses back to an event.
        let events = sig.on_packet(
            &hdr(PacketType::RelayData, 0, 5),
            &wrapped,
            20,
            collect(&mut sent),
        );
        assert_eq!(
            events[0],
            SignalEvent::RelayData {
                seq: 5,
                data: b"abc".to_vec()
            }
        );
    }
}
