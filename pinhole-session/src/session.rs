//! The session orchestrator: one `update()` call drains the socket,
//! dispatches packets to the signaling, punch, route, STUN and ICE
//! machines, pumps the byte stream through the active transport and ticks
//! every sub-state in a fixed order. All sub-states are owned fields; there
//! are no back-pointers and no locks inside the core.

use bytes::{Buf, BufMut};
use std::net::{SocketAddrV4, ToSocketAddrs};
use std::time::Instant;
use tracing::{debug, info, warn};

use pinhole_core::{lang, Error, NatKind, PathKind, PeerId, Result, SessionConfig, SessionState, SignalingMode};
use pinhole_signaling::compact::CompactSignaling;
use pinhole_signaling::offer::Offer;
use pinhole_signaling::pubsub::{GistStore, PubsubSignaling};
use pinhole_signaling::relay::RelaySignaling;
use pinhole_signaling::SignalEvent;
use pinhole_stream::{Congestion, Reliable, StreamBuffer, RELIABLE_WINDOW};
use pinhole_transport::{
    classify_nat, is_stun, Candidate, CandidateKind, CandidateList, IceChecker, IceEvent, IceRole,
    IceState, NatPunch, PacketHeader, PacketType, PskEngine, PunchEvent, RouteCtx, SecurityEngine,
    StunProbe, TurnAllocator, UdpChannel,
};

/// Largest plaintext chunk the security engine is offered, leaving room for
/// its record framing inside one stream payload.
const SECURE_PLAINTEXT_MAX: usize = 1166;

/// Callbacks fired on session state edges. Kept outside `SessionConfig` so
/// the config stays a plain (de)serializable value.
#[derive(Default)]
pub struct SessionHooks {
    /// Fired once when application data may first flow.
    pub on_connected: Option<Box<dyn FnMut() + Send>>,
    /// Fired once on the first transition out of a ready state.
    pub on_disconnected: Option<Box<dyn FnMut() + Send>>,
}

/// Exactly one signaling variant lives for the session's lifetime.
enum Signaling {
    Compact(CompactSignaling),
    Relay(RelaySignaling),
    Pubsub(PubsubSignaling),
}

struct SecureCtx {
    engine: Box<dyn SecurityEngine + Send>,
    started: bool,
}

/// One peer-to-peer session: socket, traversal machinery, reliable stream
/// and signaling, driven by periodic `update()` calls.
pub struct Session {
    config: SessionConfig,
    hooks: SessionHooks,
    epoch: Instant,

    sock: UdpChannel,
    state: SessionState,
    path: PathKind,
    nat_kind: NatKind,

    local_id: PeerId,
    remote_id: Option<PeerId>,
    locals: CandidateList,
    remotes: CandidateList,
    active_addr: Option<SocketAddrV4>,
    /// The peer's private (host) address, for the LAN shortcut probe.
    peer_host_addr: Option<SocketAddrV4>,
    public_addr: Option<SocketAddrV4>,

    reliable: Reliable,
    stream: StreamBuffer,
    congestion: Option<Congestion>,
    secure: Option<SecureCtx>,

    punch: NatPunch,
    route: RouteCtx,
    ice: Option<IceChecker>,
    stun: Option<StunProbe>,
    srflx_added: bool,
    turn: Option<TurnAllocator>,
    turn_added: bool,
    signaling: Option<Signaling>,

    lan_decided: bool,
    connected_fired: bool,
    disconnected_fired: bool,
}

fn resolve_v4(host: &str, port: u16) -> Result<SocketAddrV4> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::resolve(format!("{host}:{port}: {e}")))?
        .find_map(|a| match a {
            std::net::SocketAddr::V4(v4) => Some(v4),
            _ => None,
        })
        .ok_or_else(|| Error::resolve(format!("{host}: no IPv4 address")))
}

impl Session {
    /// Bind the socket and set up a session in `Idle`. Bind and resolve
    /// failures surface here without allocating further state.
    pub fn create(config: SessionConfig) -> Result<Self> {
        Self::create_with_hooks(config, SessionHooks::default())
    }

    pub fn create_with_hooks(config: SessionConfig, hooks: SessionHooks) -> Result<Self> {
        lang::set_language(config.language);
        let sock = UdpChannel::bind(config.bind_port)?;
        let local_id = match &config.local_peer_id {
            Some(id) => PeerId::from(id.as_str()),
            None => PeerId::from(format!("peer-{:08x}", rand::random::<u32>()).as_str()),
        };
        let secure = config.use_dtls.then(|| {
            let key = config.auth_key.as_deref().unwrap_or("pinhole");
            SecureCtx {
                engine: Box::new(PskEngine::new(key.as_bytes(), config.dtls_server)) as _,
                started: false,
            }
        });
        let congestion = config.use_pseudotcp.then(Congestion::new);
        let punch = NatPunch::new(config.verbose_nat_punch);
        let stream = StreamBuffer::new(config.nagle);
        Ok(Self {
            hooks,
            epoch: Instant::now(),
            sock,
            state: SessionState::Idle,
            path: PathKind::None,
            nat_kind: NatKind::Unknown,
            local_id,
            remote_id: None,
            locals: CandidateList::new(),
            remotes: CandidateList::new(),
            active_addr: None,
            peer_host_addr: None,
            public_addr: None,
            reliable: Reliable::new(),
            stream,
            congestion,
            secure,
            punch,
            route: RouteCtx::new(),
            ice: None,
            stun: None,
            srflx_added: false,
            turn: None,
            turn_added: false,
            signaling: None,
            lan_decided: false,
            connected_fired: false,
            disconnected_fired: false,
            config,
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn path(&self) -> PathKind {
        self.path
    }

    pub fn nat_kind(&self) -> NatKind {
        self.nat_kind
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_port(&self) -> u16 {
        self.sock.local_port()
    }

    /// Tick cadence the worker mode should use.
    pub fn config_update_interval_ms(&self) -> u64 {
        self.config.update_interval_ms
    }

    pub fn active_addr(&self) -> Option<SocketAddrV4> {
        self.active_addr
    }

    /// True when `send`/`recv` may carry application data.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
            && self
                .secure
                .as_ref()
                .map(|s| s.engine.handshake_done())
                .unwrap_or(true)
    }

    /// Start connecting. `remote` is the target peer id; `None` makes this
    /// a passive session that waits to be contacted.
    pub fn connect(&mut self, remote: Option<&str>) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::protocol("connect on a non-idle session"));
        }
        if let Err(e) = self.config.validate() {
            self.state = SessionState::Error;
            return Err(e);
        }
        self.remote_id = remote.map(PeerId::from);
        let now = self.now_ms();

        if !self.config.skip_host_candidates {
            let port = self.sock.local_port();
            for (i, net) in self.route.locals().to_vec().iter().enumerate() {
                self.locals
                    .push(Candidate::host(SocketAddrV4::new(net.addr, port), i as u32));
            }
        }
        if self.config.lan_punch {
            self.nat_kind = NatKind::Open;
        }
        if self.config.use_ice {
            let role = if remote.is_some() {
                IceRole::Controlling
            } else {
                IceRole::Controlled
            };
            let mut ice = IceChecker::new(role);
            ice.begin_gathering();
            self.ice = Some(ice);
        }
        if let Some(host) = self.config.stun_server.clone() {
            self.stun = Some(StunProbe::new(resolve_v4(&host, self.config.stun_port)?));
        }
        if let Some(host) = self.config.turn_server.clone() {
            let server = resolve_v4(&host, self.config.turn_port)?;
            let user = self.config.turn_user.clone().unwrap_or_default();
            let pass = self.config.turn_pass.clone().unwrap_or_default();
            self.turn = Some(TurnAllocator::new(server, &user, &pass));
        }

        match self.config.signaling_mode {
            SignalingMode::Compact => {
                let host = self.config.server_host.clone().unwrap_or_default();
                let server = resolve_v4(&host, self.config.server_port)?;
                let mut ctx = CompactSignaling::new(
                    server,
                    self.local_id,
                    self.remote_id,
                    self.config.lan_punch,
                );
                let sock = &self.sock;
                ctx.start(&self.locals, now, |a, t, f, s, p| {
                    let _ = sock.send_packet(a, t, f, s, p);
                });
                self.signaling = Some(Signaling::Compact(ctx));
            }
            SignalingMode::Relay => {
                let host = self.config.server_host.clone().unwrap_or_default();
                let server = resolve_v4(&host, self.config.server_port)?;
                let mut ctx = match RelaySignaling::connect(server, self.local_id) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        self.state = SessionState::Error;
                        return Err(e);
                    }
                };
                if let Some(target) = self.remote_id {
                    ctx.send_connect(&self.build_offer(target))?;
                }
                self.signaling = Some(Signaling::Relay(ctx));
            }
            SignalingMode::Pubsub => {
                let token = self.config.gh_token.clone().unwrap_or_default();
                let gist = self.config.gist_id.clone().unwrap_or_default();
                let store = Box::new(GistStore::new(&token, &gist));
                self.signaling = Some(Signaling::Pubsub(PubsubSignaling::new(
                    store,
                    self.local_id,
                    self.remote_id,
                    self.config.auth_key.as_deref(),
                )));
            }
        }
        self.state = SessionState::Registering;
        info!(local = %self.local_id, ?remote, "session connecting");
        Ok(())
    }

    /// Queue bytes for the peer. Returns how many were accepted; fewer than
    /// requested means the send ring is applying backpressure.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if !self.is_ready() {
            return Err(Error::protocol("session is not ready"));
        }
        Ok(self.stream.write(data))
    }

    /// Read received bytes; 0 means none are pending.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf))
    }

    /// Drive every state machine once. Call at a ~10 ms cadence.
    pub fn update(&mut self) -> Result<()> {
        match self.state {
            SessionState::Error => return Err(Error::protocol("session is in error state")),
            SessionState::Closed | SessionState::Closing | SessionState::Idle => return Ok(()),
            _ => {}
        }
        let now = self.now_ms();

        // 1. Drain the socket.
        let mut buf = [0u8; 2048];
        while let Some((n, from)) = self.sock.recv_from(&mut buf)? {
            let datagram = buf[..n].to_vec();
            self.on_datagram(&datagram, from, now);
            if matches!(self.state, SessionState::Closed | SessionState::Error) {
                return Ok(());
            }
        }

        // 2. Path promotion decided by earlier events.
        self.check_lan_promotion();

        // 3. Pump the stream through the active transport.
        self.pump_stream(now);

        // 4. Ticks, in fixed order: transport, punch, STUN/TURN, ICE,
        //    signaling.
        self.tick_transport(now);
        self.tick_punch(now);
        self.tick_stun(now);
        self.tick_ice(now);
        self.tick_signaling(now);
        Ok(())
    }

    /// Synchronous close: FIN on the active path, UNREGISTER / TCP
    /// teardown, terminal state.
    pub fn close(&mut self) {
        let was_ready = self.state.is_ready();
        if was_ready {
            if let Some(addr) = self.active_addr {
                if self.path != PathKind::Relay {
                    let _ = self.sock.send_packet(addr, PacketType::Fin, 0, 0, &[]);
                }
            }
        }
        self.state = SessionState::Closing;
        let sock = &self.sock;
        match &mut self.signaling {
            Some(Signaling::Compact(c)) => c.close(|a, t, f, s, p| {
                let _ = sock.send_packet(a, t, f, s, p);
            }),
            Some(Signaling::Relay(r)) => r.close(),
            _ => {}
        }
        self.signaling = None;
        self.state = SessionState::Closed;
        if was_ready {
            self.fire_disconnected();
        }
        debug!("session closed");
    }

    // ------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------

    fn on_datagram(&mut self, data: &[u8], from: SocketAddrV4, now: u64) {
        if is_stun(data) {
            self.on_stun_datagram(data);
            return;
        }
        let Ok((hdr, payload)) = PacketHeader::decode(data) else {
            // Short or unknown datagrams are dropped silently.
            return;
        };
        match hdr.ptype {
            PacketType::Register
            | PacketType::RegisterAck
            | PacketType::PeerInfo
            | PacketType::PeerInfoAck
            | PacketType::Alive
            | PacketType::AliveAck
            | PacketType::NatProbe
            | PacketType::NatProbeAck
            | PacketType::Unregister
            | PacketType::PeerOff
            | PacketType::RelayData
            | PacketType::RelayAck => {
                let events = match &mut self.signaling {
                    Some(Signaling::Compact(c)) => {
                        let sock = &self.sock;
                        c.on_packet(&hdr, payload, now, |a, t, f, s, p| {
                            let _ = sock.send_packet(a, t, f, s, p);
                        })
                    }
                    _ => Vec::new(),
                };
                for ev in events {
                    self.on_signal_event(ev, now);
                }
            }
            PacketType::Punch => {
                self.note_peer_address(from);
                let sock = &self.sock;
                let ev = self.punch.on_punch(from, now, |a, t| {
                    let _ = sock.send_packet(a, t, 0, 0, &[]);
                });
                if let Some(ev) = ev {
                    self.on_punch_event(ev, now);
                }
            }
            PacketType::PunchAck => {
                self.note_peer_address(from);
                if let Some(ev) = self.punch.on_punch_ack(from, now) {
                    self.on_punch_event(ev, now);
                }
            }
            PacketType::Ping => {
                let sock = &self.sock;
                self.punch.on_ping(from, now, |a, t| {
                    let _ = sock.send_packet(a, t, 0, 0, &[]);
                });
            }
            PacketType::Pong => self.punch.on_pong(now),
            PacketType::Data => {
                if self.state.is_ready() {
                    self.reliable.on_data(hdr.seq, payload);
                    self.punch.note_recv(now);
                }
            }
            PacketType::Ack => {
                if self.state.is_ready() && payload.len() >= 6 {
                    let mut cursor = payload;
                    let ack_seq = cursor.get_u16();
                    let sack = cursor.get_u32();
                    self.apply_ack(ack_seq, sack, now);
                    self.punch.note_recv(now);
                }
            }
            PacketType::Fin => {
                info!("peer closed the session");
                let was_ready = self.state.is_ready();
                self.state = SessionState::Closed;
                if was_ready {
                    self.fire_disconnected();
                }
            }
            PacketType::RouteProbe => {
                let sock = &self.sock;
                self.route.on_probe(from, payload, |a, t, p| {
                    let _ = sock.send_packet(a, t, 0, 0, &p);
                });
            }
            PacketType::RouteProbeAck => self.route.on_probe_ack(from),
            PacketType::Auth => {
                if !self.state.is_ready() {
                    return;
                }
                let expected = self.config.auth_key.clone().unwrap_or_default();
                if payload != expected.as_bytes() {
                    warn!("auth payload mismatch, dropping session");
                    let was_ready = self.state.is_ready();
                    self.state = SessionState::Error;
                    if was_ready {
                        self.fire_disconnected();
                    }
                }
            }
        }
    }

    fn on_stun_datagram(&mut self, data: &[u8]) {
        if let Some(probe) = &mut self.stun {
            if probe.on_datagram(data).is_some() {
                return;
            }
        }
        if let Some(turn) = &mut self.turn {
            turn.on_datagram(data);
        }
    }

    // ------------------------------------------------------------------
    // Signaling event handling
    // ------------------------------------------------------------------

    fn on_signal_event(&mut self, event: SignalEvent, now: u64) {
        match event {
            SignalEvent::RemoteCandidate(cand) => self.admit_remote(cand, now),
            SignalEvent::RemoteCandidatesDone => {
                if let Some(ice) = &mut self.ice {
                    ice.gathering_done();
                }
                if self.state == SessionState::Registering && !self.remotes.is_empty() {
                    self.start_punching(now);
                }
            }
            SignalEvent::PeerLearned(id) => {
                debug!(peer = %id, "remote peer learned");
                self.remote_id = Some(id);
                self.maybe_answer();
            }
            SignalEvent::PeerReset(id) => {
                self.remote_id = Some(id);
                if let Some(ice) = &mut self.ice {
                    if matches!(ice.state(), IceState::Checking | IceState::Failed) {
                        ice.reset();
                        self.remotes.clear();
                    }
                }
                self.maybe_answer();
            }
            SignalEvent::PeerList(peers) => {
                debug!(count = peers.len(), "peer list received");
            }
            SignalEvent::PublicAddr(addr) => {
                self.public_addr = Some(addr);
                self.add_srflx(addr);
            }
            SignalEvent::NatProbeResult(probe) => {
                if let Some(public1) = self.public_addr {
                    self.nat_kind =
                        classify_nat(self.route.locals(), public1, probe, self.config.lan_punch);
                    info!(kind = ?self.nat_kind, "nat classified");
                }
            }
            SignalEvent::PeerOffline => {
                self.remotes.clear();
                if !self.state.is_ready() {
                    self.punch = NatPunch::new(self.config.verbose_nat_punch);
                    self.state = SessionState::Registering;
                }
            }
            SignalEvent::SignalingFailed(msg) => {
                warn!(%msg, "signaling failed");
                if !self.state.is_ready() {
                    self.state = SessionState::Error;
                }
            }
            SignalEvent::RelayData { seq, data } => {
                if self.state.is_ready() {
                    self.reliable.on_data(seq, &data);
                    self.punch.note_recv(now);
                }
            }
            SignalEvent::RelayAck { ack_seq, sack_bits } => {
                if self.state.is_ready() {
                    self.apply_ack(ack_seq, sack_bits, now);
                    self.punch.note_recv(now);
                }
            }
        }
    }

    fn admit_remote(&mut self, cand: Candidate, now: u64) {
        if !self.remotes.push(cand) {
            return;
        }
        debug!(%cand, "remote candidate admitted");
        if cand.kind == CandidateKind::Host && self.peer_host_addr.is_none() {
            self.peer_host_addr = Some(cand.addr);
        }
        if let Some(ice) = &mut self.ice {
            ice.rebuild_pairs(&self.locals, &self.remotes);
        }
        if self.state == SessionState::Registering {
            self.state = SessionState::Punching;
        }
        // Trickle: punch the new candidate right away.
        let sock = &self.sock;
        self.punch.trickle(cand.addr, now, |a, t| {
            let _ = sock.send_packet(a, t, 0, 0, &[]);
        });
    }

    fn start_punching(&mut self, now: u64) {
        let sock = &self.sock;
        let started = self.punch.start(&self.remotes, now, |a, t| {
            let _ = sock.send_packet(a, t, 0, 0, &[]);
        });
        if started.is_ok() {
            self.state = SessionState::Punching;
        }
    }

    /// A PUNCH or PUNCH_ACK arrived from an address we never learned via
    /// signaling: record it as a peer-reflexive candidate.
    fn note_peer_address(&mut self, from: SocketAddrV4) {
        if self.remotes.contains(from) {
            return;
        }
        if self.remotes.push(Candidate::peer_reflexive(from)) {
            debug!(%from, "peer-reflexive candidate discovered");
            if let Some(ice) = &mut self.ice {
                ice.rebuild_pairs(&self.locals, &self.remotes);
            }
        }
    }

    fn add_srflx(&mut self, addr: SocketAddrV4) {
        let base = self
            .locals
            .iter()
            .find(|c| c.kind == CandidateKind::Host)
            .map(|c| c.addr)
            .unwrap_or_else(|| SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));
        if self.locals.push(Candidate::server_reflexive(addr, base)) {
            debug!(%addr, "server-reflexive candidate added");
            self.resend_offer();
        }
    }

    /// Re-announce the (grown) local candidate set where the variant allows
    /// it: the relay variant re-sends CONNECT with the cumulative set.
    fn resend_offer(&mut self) {
        let Some(target) = self.remote_id else { return };
        let offer = self.build_offer(target);
        if let Some(Signaling::Relay(r)) = &mut self.signaling {
            if !r.is_closed() {
                let _ = r.send_connect(&offer);
            }
        }
    }

    fn build_offer(&self, target: PeerId) -> Offer {
        Offer {
            sender: self.local_id,
            target,
            timestamp: (self.now_ms() / 1000) as u32,
            delay_trigger: 0,
            candidates: self.locals.iter().copied().collect(),
        }
    }

    /// Passive relay sessions answer each offer with their own candidates.
    fn maybe_answer(&mut self) {
        let Some(target) = self.remote_id else { return };
        let offer = self.build_offer(target);
        if let Some(Signaling::Relay(r)) = &mut self.signaling {
            if !r.is_closed() {
                let _ = r.send_answer(&offer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Path transitions
    // ------------------------------------------------------------------

    fn on_punch_event(&mut self, event: PunchEvent, now: u64) {
        match event {
            PunchEvent::Connected(addr) => self.enter_direct(addr, now),
            PunchEvent::RelayFallback => {
                if !self.enter_relay() {
                    debug!("no relay support, continuing direct probes");
                }
            }
            PunchEvent::Disconnected => {
                let was_ready = self.state.is_ready();
                self.state = SessionState::Error;
                if was_ready {
                    self.fire_disconnected();
                }
            }
        }
    }

    fn enter_direct(&mut self, addr: SocketAddrV4, _now: u64) {
        let was_ready = self.state.is_ready();
        self.state = SessionState::Connected;
        self.path = PathKind::Punch;
        self.active_addr = Some(addr);
        if let Some(ice) = &mut self.ice {
            ice.on_success(addr);
        }

        // LAN shortcut is inspected exactly once, at this transition.
        if !self.lan_decided {
            self.lan_decided = true;
            if !self.config.disable_lan_shortcut {
                if let Some(peer_host) = self.peer_host_addr {
                    if self.route.same_subnet(*peer_host.ip()) {
                        let sock = &self.sock;
                        let port = sock.local_port();
                        self.route.send_probe(peer_host, port, |a, t, p| {
                            let _ = sock.send_packet(a, t, 0, 0, &p);
                        });
                    }
                }
            }
        }

        // Direct path is up; the relay signaling TCP can release server
        // resources.
        if let Some(Signaling::Relay(r)) = &mut self.signaling {
            r.close();
        }
        if !was_ready {
            self.enter_ready(addr);
        }
    }

    fn enter_relay(&mut self) -> bool {
        let Some(Signaling::Compact(c)) = &self.signaling else {
            return false;
        };
        if !c.relay_support() || c.session_id().is_none() {
            return false;
        }
        let server = c.server_addr();
        info!(%server, "falling back to server relay");
        self.state = SessionState::Relay;
        self.path = PathKind::Relay;
        self.active_addr = Some(server);
        self.enter_ready(server);
        true
    }

    fn enter_ready(&mut self, addr: SocketAddrV4) {
        if let Some(key) = &self.config.auth_key {
            if self.path != PathKind::Relay {
                let _ = self
                    .sock
                    .send_packet(addr, PacketType::Auth, 0, 0, key.as_bytes());
            }
        }
        if let Some(ctx) = &mut self.secure {
            if !ctx.started {
                ctx.started = true;
                match ctx.engine.start() {
                    Ok(records) => {
                        for record in records {
                            let _ = self.reliable.send_pkt(&record);
                        }
                    }
                    Err(e) => warn!(error = %e, "security engine start failed"),
                }
            }
        }
        self.fire_connected_if_ready();
    }

    fn check_lan_promotion(&mut self) {
        if self.state != SessionState::Connected || self.path != PathKind::Punch {
            return;
        }
        if self.config.disable_lan_shortcut {
            return;
        }
        if let Some(lan) = self.route.lan_confirmed() {
            info!(%lan, "promoting active path to lan");
            self.active_addr = Some(lan);
            self.path = PathKind::Lan;
        }
    }

    fn fire_connected_if_ready(&mut self) {
        if self.connected_fired || !self.is_ready() {
            return;
        }
        self.connected_fired = true;
        if let Some(cb) = &mut self.hooks.on_connected {
            cb();
        }
    }

    fn fire_disconnected(&mut self) {
        if self.disconnected_fired {
            return;
        }
        self.disconnected_fired = true;
        if let Some(cb) = &mut self.hooks.on_disconnected {
            cb();
        }
    }

    // ------------------------------------------------------------------
    // Stream / transport pump
    // ------------------------------------------------------------------

    fn apply_ack(&mut self, ack_seq: u16, sack: u32, now: u64) {
        let summary = self.reliable.on_ack(ack_seq, sack, now);
        if let Some(cc) = &mut self.congestion {
            cc.on_ack(summary.newly_acked, summary.duplicate);
        }
    }

    fn pump_stream(&mut self, _now: u64) {
        if !self.state.is_ready() {
            return;
        }
        match &mut self.secure {
            None => {
                self.stream.flush_to_reliable(&mut self.reliable);
                let _ = self.stream.feed_from_reliable(&mut self.reliable);
            }
            Some(ctx) => {
                if ctx.engine.handshake_done() {
                    while self.reliable.window_free() > 0 && self.stream.pending_bytes() > 0 {
                        let chunk = self.stream.take_pending(SECURE_PLAINTEXT_MAX);
                        match ctx.engine.offer_plaintext(&chunk) {
                            Ok(record) => {
                                if self.reliable.send_pkt(&record).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "record protection failed");
                                break;
                            }
                        }
                    }
                }
                while let Some(record) = self.reliable.pop_in_order() {
                    match ctx.engine.offer_ciphertext(&record) {
                        Ok(out) => {
                            for plaintext in out.plaintext {
                                self.stream.deliver(&plaintext);
                            }
                            for transmit in out.transmit {
                                let _ = self.reliable.send_pkt(&transmit);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "security engine rejected a record");
                            self.state = SessionState::Error;
                            return;
                        }
                    }
                }
                self.fire_connected_if_ready();
            }
        }
    }

    fn tick_transport(&mut self, now: u64) {
        if !self.state.is_ready() {
            return;
        }
        let budget = self
            .congestion
            .as_ref()
            .map(|c| c.window_packets())
            .unwrap_or(RELIABLE_WINDOW);
        let relay_mode = self.path == PathKind::Relay;
        let sock = &self.sock;
        let compact = match &self.signaling {
            Some(Signaling::Compact(c)) => Some(c),
            _ => None,
        };
        let active = self.active_addr;

        let mut sent_any = false;
        let summary = self.reliable.tick_send(now, budget, |seq, payload| {
            sent_any = true;
            if relay_mode {
                if let Some(c) = compact {
                    if let Some(wrapped) = c.relay_wrap_data(payload) {
                        let _ =
                            sock.send_packet(c.server_addr(), PacketType::RelayData, 0, seq, &wrapped);
                    }
                }
            } else if let Some(addr) = active {
                let _ = sock.send_packet(addr, PacketType::Data, 0, seq, payload);
            }
        });
        if summary.retransmits > 0 {
            if let Some(cc) = &mut self.congestion {
                cc.on_timeout();
            }
        }
        if sent_any {
            self.punch.note_send(now);
        }

        if let Some((ack_seq, sack)) = self.reliable.build_ack() {
            let mut payload = Vec::with_capacity(6);
            payload.put_u16(ack_seq);
            payload.put_u32(sack);
            let sock = &self.sock;
            if relay_mode {
                if let Some(Signaling::Compact(c)) = &self.signaling {
                    if let Some(wrapped) = c.relay_wrap_ack(ack_seq, sack) {
                        let _ = sock.send_packet(
                            c.server_addr(),
                            PacketType::RelayAck,
                            0,
                            ack_seq,
                            &wrapped,
                        );
                    }
                }
            } else if let Some(addr) = self.active_addr {
                let _ = sock.send_packet(addr, PacketType::Ack, 0, ack_seq, &payload);
                self.punch.note_send(now);
            }
        }
    }

    fn tick_punch(&mut self, now: u64) {
        let sock = &self.sock;
        let ev = self.punch.tick(now, &self.remotes, |a, t| {
            let _ = sock.send_packet(a, t, 0, 0, &[]);
        });
        if let Some(ev) = ev {
            self.on_punch_event(ev, now);
        }
    }

    fn tick_stun(&mut self, now: u64) {
        let sock = &self.sock;
        if let Some(probe) = &mut self.stun {
            probe.tick(now, |a, d| {
                let _ = sock.send_raw(a, &d);
            });
        }
        if let Some(turn) = &mut self.turn {
            turn.tick(now, |a, d| {
                let _ = sock.send_raw(a, &d);
            });
        }
        if !self.srflx_added {
            if let Some(mapped) = self.stun.as_ref().and_then(|p| p.mapped()) {
                self.srflx_added = true;
                self.add_srflx(mapped);
            }
        }
        if !self.turn_added {
            if let Some(relayed) = self.turn.as_ref().and_then(|t| t.relayed()) {
                self.turn_added = true;
                let base = self.public_addr.unwrap_or(relayed);
                if self.locals.push(Candidate::relay(relayed, base)) {
                    debug!(%relayed, "relay candidate added");
                    self.resend_offer();
                }
            }
        }
    }

    fn tick_ice(&mut self, now: u64) {
        let Some(ice) = &mut self.ice else { return };
        let sock = &self.sock;
        let ev = ice.tick(now, &self.remotes, |a, t| {
            let _ = sock.send_packet(a, t, 0, 0, &[]);
        });
        if let Some(IceEvent::Failed) = ev {
            if !self.state.is_ready() && !self.enter_relay() {
                warn!("connectivity checks failed with no relay fallback");
                self.state = SessionState::Error;
            }
        }
    }

    fn tick_signaling(&mut self, now: u64) {
        let events = match &mut self.signaling {
            Some(Signaling::Compact(c)) => {
                let sock = &self.sock;
                c.tick(now, &self.locals, |a, t, f, s, p| {
                    let _ = sock.send_packet(a, t, f, s, p);
                })
            }
            Some(Signaling::Relay(r)) => match r.tick(now) {
                Ok(events) => events,
                Err(e) => vec![SignalEvent::SignalingFailed(e.to_string())],
            },
            Some(Signaling::Pubsub(p)) => p.tick(now, &self.locals),
            None => Vec::new(),
        };
        for ev in events {
            self.on_signal_event(ev, now);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !matches!(self.state, SessionState::Closed | SessionState::Idle) {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            server_host: Some("127.0.0.1".into()),
            server_port: 1, // never contacted in these tests
            ..SessionConfig::default()
        }
    }

    #[test]
    fn create_binds_a_socket() {
        let session = Session::create(config()).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_ne!(session.local_port(), 0);
        assert_eq!(session.path(), PathKind::None);
    }

    #[test]
    fn send_requires_ready_state() {
        let mut session = Session::create(config()).unwrap();
        assert!(session.send(b"data").is_err());
        let mut buf = [0u8; 8];
        assert_eq!(session.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn connect_validates_config() {
        let mut session = Session::create(SessionConfig::default()).unwrap();
        assert!(session.connect(Some("peer")).is_err());
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut session = Session::create(config()).unwrap();
        session.connect(Some("peer")).unwrap();
        assert!(session.connect(Some("peer")).is_err());
    }

    #[test]
    fn lan_punch_classifies_open_without_probe() {
        let mut cfg = config();
        cfg.lan_punch = true;
        let mut session = Session::create(cfg).unwrap();
        session.connect(None).unwrap();
        assert_eq!(session.nat_kind(), NatKind::Open);
    }

    #[test]
    fn close_is_terminal() {
        let mut session = Session::create(config()).unwrap();
        session.connect(Some("peer")).unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.update().is_ok());
    }
}
