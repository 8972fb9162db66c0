//! Relay signaling: a long-lived TCP session with a rendezvous server
//! speaking length-prefixed frames `[magic "P2P0", type:u8, length:u32,
//! payload]`.
//!
//! Only the initial connect and LOGIN round-trip block (with a bounded
//! timeout). Everything afterwards is non-blocking: each tick performs at
//! most one `recv`, and the frame reader is a resumable byte-level state
//! machine (`idle -> header -> sender -> payload | discard -> idle`) that
//! survives a frame arriving one byte at a time.

use bytes::{Buf, BufMut};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;
use tracing::{debug, warn};

use pinhole_core::{Error, PeerId, Result};

use crate::offer::Offer;
use crate::SignalEvent;

/// Frame magic, the ASCII bytes `P2P0`.
pub const FRAME_MAGIC: [u8; 4] = *b"P2P0";

/// Frames larger than this are discarded without buffering.
const MAX_FRAME_LEN: usize = 64 * 1024;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// CONNECT retry cadence while the server cache is full.
const CONNECT_RETRY_MS: u64 = 10_000;
/// Give up waiting for a cache slot after this long.
const PEER_WAIT_TIMEOUT_MS: u64 = 120_000;

/// Relay frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Login = 1,
    LoginAck = 2,
    List = 3,
    ListRes = 4,
    Connect = 5,
    Offer = 6,
    Answer = 7,
    Forward = 8,
    ConnectAck = 9,
    Heartbeat = 10,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Login,
            2 => Self::LoginAck,
            3 => Self::List,
            4 => Self::ListRes,
            5 => Self::Connect,
            6 => Self::Offer,
            7 => Self::Answer,
            8 => Self::Forward,
            9 => Self::ConnectAck,
            10 => Self::Heartbeat,
            _ => return None,
        })
    }

    /// OFFER and FORWARD carry a 32-byte sender id before the payload.
    fn has_sender(self) -> bool {
        matches!(self, Self::Offer | Self::Forward)
    }
}

/// A fully reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sender: Option<PeerId>,
    pub payload: Vec<u8>,
}

/// CONNECT_ACK statuses.
pub const CONNECT_PEER_ONLINE: u8 = 0;
pub const CONNECT_PEER_CACHED: u8 = 1;
pub const CONNECT_CACHE_FULL: u8 = 2;

/// Serialize one frame.
pub fn encode_frame(frame_type: FrameType, sender: Option<&PeerId>, payload: &[u8]) -> Vec<u8> {
    let sender_len = if sender.is_some() { PeerId::LEN } else { 0 };
    let mut buf = Vec::with_capacity(9 + sender_len + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.push(frame_type as u8);
    buf.put_u32((sender_len + payload.len()) as u32);
    if let Some(id) = sender {
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Reader states. One frame header is 9 bytes: magic, type, length.
enum ReadState {
    Idle,
    Header {
        buf: [u8; 9],
        got: usize,
    },
    Sender {
        frame_type: FrameType,
        /// Payload bytes remaining after the sender id.
        remaining: usize,
        sender: [u8; PeerId::LEN],
        got: usize,
    },
    Payload {
        frame_type: FrameType,
        sender: Option<PeerId>,
        remaining: usize,
        buf: Vec<u8>,
    },
    Discard {
        remaining: usize,
    },
}

/// Resumable frame reader. Feed it whatever one non-blocking `recv`
/// returned; complete frames come out, partial ones wait for the next tick.
pub struct FrameReader {
    state: ReadState,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: ReadState::Idle,
        }
    }

    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while !chunk.is_empty() {
            match &mut self.state {
                ReadState::Idle => {
                    self.state = ReadState::Header {
                        buf: [0u8; 9],
                        got: 0,
                    };
                }
                ReadState::Header { buf, got } => {
                    let take = (9 - *got).min(chunk.len());
                    buf[*got..*got + take].copy_from_slice(&chunk[..take]);
                    *got += take;
                    chunk = &chunk[take..];
                    if *got < 9 {
                        continue;
                    }
                    if buf[..4] != FRAME_MAGIC {
                        return Err(Error::signaling("bad frame magic"));
                    }
                    let raw_type = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    self.state = match FrameType::from_u8(raw_type) {
                        None => {
                            warn!(raw_type, length, "unknown frame type, discarding");
                            ReadState::Discard { remaining: length }
                        }
                        Some(_) if length > MAX_FRAME_LEN => {
                            warn!(length, "oversized frame, discarding");
                            ReadState::Discard { remaining: length }
                        }
                        Some(t) if t.has_sender() => {
                            if length < PeerId::LEN {
                                return Err(Error::signaling("offer frame shorter than sender"));
                            }
                            ReadState::Sender {
                                frame_type: t,
                                remaining: length - PeerId::LEN,
                                sender: [0u8; PeerId::LEN],
                                got: 0,
                            }
                        }
                        Some(t) if length == 0 => {
                            frames.push(Frame {
                                frame_type: t,
                                sender: None,
                                payload: Vec::new(),
                            });
                            ReadState::Idle
                        }
                        Some(t) => ReadState::Payload {
                            frame_type: t,
                            sender: None,
                            remaining: length,
                            buf: Vec::with_capacity(length),
                        },
                    };
                }
                ReadState::Sender {
                    frame_type,
                    remaining,
                    sender,
                    got,
                } => {
                    let take = (PeerId::LEN - *got).min(chunk.len());
                    sender[*got..*got + take].copy_from_slice(&chunk[..take]);
                    *got += take;
                    chunk = &chunk[take..];
                    if *got == PeerId::LEN {
                        if *remaining == 0 {
                            frames.push(Frame {
                                frame_type: *frame_type,
                                sender: Some(PeerId(*sender)),
                                payload: Vec::new(),
                            });
                            self.state = ReadState::Idle;
                        } else {
                            self.state = ReadState::Payload {
                                frame_type: *frame_type,
                                sender: Some(PeerId(*sender)),
                                remaining: *remaining,
                                buf: Vec::with_capacity(*remaining),
                            };
                        }
                    }
                }
                ReadState::Payload {
                    frame_type,
                    sender,
                    remaining,
                    buf,
                } => {
                    let take = (*remaining).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    *remaining -= take;
                    chunk = &chunk[take..];
                    if *remaining == 0 {
                        frames.push(Frame {
                            frame_type: *frame_type,
                            sender: *sender,
                            payload: std::mem::take(buf),
                        });
                        self.state = ReadState::Idle;
                    }
                }
                ReadState::Discard { remaining } => {
                    let take = (*remaining).min(chunk.len());
                    *remaining -= take;
                    chunk = &chunk[take..];
                    if *remaining == 0 {
                        self.state = ReadState::Idle;
                    }
                }
            }
        }
        Ok(frames)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    LoggedIn,
    /// CONNECT was answered with cache-full; retrying until the window ends.
    WaitingForPeer { since_ms: u64, last_retry_ms: u64 },
    Closed,
}

/// Relay signaling context for one session.
pub struct RelaySignaling {
    stream: TcpStream,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    reader: FrameReader,
    state: RelayState,
    last_heartbeat_ms: u64,
    /// Encoded CONNECT payload, kept for cache-full retries.
    pending_connect: Option<Vec<u8>>,
    recv_buf: Vec<u8>,
}

impl RelaySignaling {
    /// Connect and log in. This is the one blocking step of the protocol:
    /// the TCP connect and the LOGIN/LOGIN_ACK round-trip wait up to five
    /// seconds, after which the stream turns non-blocking for good.
    pub fn connect(server: SocketAddrV4, local_id: PeerId) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(server), LOGIN_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(LOGIN_TIMEOUT))?;

        let mut this = Self {
            stream,
            local_id,
            remote_id: None,
            reader: FrameReader::new(),
            state: RelayState::LoggedIn,
            last_heartbeat_ms: 0,
            pending_connect: None,
            recv_buf: vec![0u8; 4096],
        };
        this.send_frame(FrameType::Login, local_id.as_bytes())?;

        // Blocking wait for LOGIN_ACK; any other frame first is a protocol
        // violation.
        let ack = this.read_frame_blocking()?;
        if ack.frame_type != FrameType::LoginAck {
            return Err(Error::signaling("expected LOGIN_ACK"));
        }
        if ack.payload.first().copied().unwrap_or(1) != 0 {
            return Err(Error::signaling("login rejected"));
        }
        debug!(%server, "relay signaling logged in");
        this.stream.set_nonblocking(true)?;
        Ok(this)
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.state == RelayState::Closed
    }

    /// Send our candidate offer toward `offer.target` through the server.
    pub fn send_connect(&mut self, offer: &Offer) -> Result<()> {
        let payload = offer.encode();
        self.remote_id = Some(offer.target);
        self.pending_connect = Some(payload.clone());
        self.send_frame(FrameType::Connect, &payload)
    }

    /// Answer an incoming offer with our own candidates.
    pub fn send_answer(&mut self, offer: &Offer) -> Result<()> {
        self.send_frame(FrameType::Answer, &offer.encode())
    }

    /// Ask the server for the registered peer list.
    pub fn send_list(&mut self) -> Result<()> {
        self.send_frame(FrameType::List, &[])
    }

    /// One tick: a single non-blocking read, frame handling, heartbeat and
    /// cache-full retry bookkeeping.
    pub fn tick(&mut self, now_ms: u64) -> Result<Vec<SignalEvent>> {
        if self.state == RelayState::Closed {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();

        match self.stream.read(&mut self.recv_buf) {
            Ok(0) => {
                self.state = RelayState::Closed;
                events.push(SignalEvent::SignalingFailed("server closed the tcp link".into()));
                return Ok(events);
            }
            Ok(n) => {
                let chunk = self.recv_buf[..n].to_vec();
                match self.reader.feed(&chunk) {
                    Ok(frames) => {
                        for frame in frames {
                            events.extend(self.on_frame(frame, now_ms)?);
                        }
                    }
                    Err(e) => {
                        self.state = RelayState::Closed;
                        events.push(SignalEvent::SignalingFailed(e.to_string()));
                        return Ok(events);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                self.state = RelayState::Closed;
                events.push(SignalEvent::SignalingFailed(e.to_string()));
                return Ok(events);
            }
        }

        if now_ms.saturating_sub(self.last_heartbeat_ms) >= HEARTBEAT_INTERVAL_MS {
            self.last_heartbeat_ms = now_ms;
            self.send_frame(FrameType::Heartbeat, &[])?;
        }

        if let RelayState::WaitingForPeer {
            since_ms,
            last_retry_ms,
        } = self.state
        {
            if now_ms.saturating_sub(since_ms) >= PEER_WAIT_TIMEOUT_MS {
                self.state = RelayState::Closed;
                events.push(SignalEvent::SignalingFailed(
                    "peer wait window expired".into(),
                ));
            } else if now_ms.saturating_sub(last_retry_ms) >= CONNECT_RETRY_MS {
                if let Some(payload) = self.pending_connect.clone() {
                    debug!("retrying CONNECT while server cache is full");
                    self.send_frame(FrameType::Connect, &payload)?;
                }
                self.state = RelayState::WaitingForPeer {
                    since_ms,
                    last_retry_ms: now_ms,
                };
            }
        }
        Ok(events)
    }

    fn on_frame(&mut self, frame: Frame, now_ms: u64) -> Result<Vec<SignalEvent>> {
        let mut events = Vec::new();
        match frame.frame_type {
            FrameType::Offer | FrameType::Forward => {
                let offer = Offer::decode(&frame.payload)?;
                let sender = frame.sender.unwrap_or(offer.sender);
                // Offers carry the sender's full candidate set, so a repeat
                // offer is a reconnection (or a trickle update) and the
                // session may reset stale check state before re-admission.
                let reconnection = self.remote_id.is_some();
                self.remote_id = Some(sender);
                if reconnection {
                    events.push(SignalEvent::PeerReset(sender));
                } else {
                    events.push(SignalEvent::PeerLearned(sender));
                }
                for cand in offer.candidates {
                    events.push(SignalEvent::RemoteCandidate(cand));
                }
            }
            FrameType::Answer => {
                let offer = Offer::decode(&frame.payload)?;
                if self.remote_id.is_none() {
                    self.remote_id = Some(offer.sender);
                    events.push(SignalEvent::PeerLearned(offer.sender));
                }
                for cand in offer.candidates {
                    events.push(SignalEvent::RemoteCandidate(cand));
                }
            }
            FrameType::ConnectAck => {
                if frame.payload.is_empty() {
                    return Ok(events);
                }
                let status = frame.payload[0];
                match status {
                    CONNECT_PEER_ONLINE => {
                        debug!("peer online, offer delivered");
                        self.state = RelayState::LoggedIn;
                    }
                    CONNECT_PEER_CACHED => {
                        debug!("peer offline, offer cached");
                        self.state = RelayState::LoggedIn;
                    }
                    CONNECT_CACHE_FULL => {
                        debug!("server cache full, entering peer-wait");
                        self.state = RelayState::WaitingForPeer {
                            since_ms: now_ms,
                            last_retry_ms: now_ms,
                        };
                    }
                    other => {
                        warn!(status = other, "unknown CONNECT_ACK status");
                    }
                }
            }
            FrameType::ListRes => {
                let peers = frame
                    .payload
                    .chunks_exact(PeerId::LEN)
                    .map(PeerId::from_bytes)
                    .collect();
                events.push(SignalEvent::PeerList(peers));
            }
            FrameType::Heartbeat | FrameType::LoginAck => {}
            other => {
                warn!(?other, "unexpected relay frame");
            }
        }
        Ok(events)
    }

    /// Close the TCP link; called on session close or once P2P is up and
    /// server resources can be released.
    pub fn close(&mut self) {
        if self.state != RelayState::Closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.state = RelayState::Closed;
        }
    }

    fn send_frame(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(frame_type, None, payload);
        self.stream.write_all(&frame)?;
        Ok(())
    }

    fn read_frame_blocking(&mut self) -> Result<Frame> {
        // Used only during login while the stream still blocks.
        let mut header = [0u8; 9];
        self.stream.read_exact(&mut header)?;
        let mut frames = self.reader.feed(&header)?;
        if let Some(frame) = frames.pop() {
            return Ok(frame);
        }
        let mut cursor = &header[5..9];
        let length = (cursor.get_u32() as usize).min(MAX_FRAME_LEN);
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        self.reader
            .feed(&payload)?
            .pop()
            .ok_or_else(|| Error::signaling("truncated login frame"))
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_transport::Candidate;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn offer_with(n: u8) -> Offer {
        let mut candidates = Vec::new();
        for i in 0..n {
            candidates.push(Candidate::host(
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i + 1), 7000 + i as u16),
                0,
            ));
        }
        Offer {
            sender: PeerId::from("bob"),
            target: PeerId::from("alice"),
            timestamp: 1,
            delay_trigger: 0,
            candidates,
        }
    }

    #[test]
    fn reader_handles_byte_at_a_time_delivery() {
        let offer = offer_with(2);
        let frame = encode_frame(FrameType::Offer, Some(&PeerId::from("bob")), &offer.encode());

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for byte in &frame {
            frames.extend(reader.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Offer);
        assert_eq!(frames[0].sender, Some(PeerId::from("bob")));
        assert_eq!(Offer::decode(&frames[0].payload).unwrap(), offer);
    }

    #[test]
    fn reader_handles_coalesced_frames() {
        let mut data = encode_frame(FrameType::Heartbeat, None, &[]);
        data.extend(encode_frame(FrameType::ConnectAck, None, &[0, 0, 0]));

        let mut reader = FrameReader::new();
        let frames = reader.feed(&data).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::Heartbeat);
        assert_eq!(frames[1].frame_type, FrameType::ConnectAck);
    }

    #[test]
    fn reader_discards_unknown_frames_and_recovers() {
        let mut data = Vec::new();
        data.extend_from_slice(&FRAME_MAGIC);
        data.push(200); // unknown type
        data.put_u32(5);
        data.extend_from_slice(&[1, 2, 3, 4, 5]);
        data.extend(encode_frame(FrameType::Heartbeat, None, &[]));

        let mut reader = FrameReader::new();
        let frames = reader.feed(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Heartbeat);
    }

    #[test]
    fn reader_rejects_bad_magic() {
        let mut reader = FrameReader::new();
        assert!(reader.feed(b"XXXX\x01\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn login_and_offer_over_loopback() {
        use std::io::{Read as _, Write as _};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Read LOGIN (9 + 32 bytes).
            let mut login = [0u8; 41];
            sock.read_exact(&mut login).unwrap();
            assert_eq!(&login[..4], &FRAME_MAGIC);
            assert_eq!(login[4], FrameType::Login as u8);
            // LOGIN_ACK status 0.
            sock.write_all(&encode_frame(FrameType::LoginAck, None, &[0]))
                .unwrap();
            // Forward an offer from bob.
            let offer = offer_with(1);
            sock.write_all(&encode_frame(
                FrameType::Offer,
                Some(&PeerId::from("bob")),
                &offer.encode(),
            ))
            .unwrap();
            // Hold the socket open briefly so the client can read.
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut sig = RelaySignaling::connect(addr, PeerId::from("alice")).unwrap();
        let mut events = Vec::new();
        for i in 0..50 {
            events.extend(sig.tick(i * 10).unwrap());
            if events.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(events.contains(&SignalEvent::PeerLearned(PeerId::from("bob"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, SignalEvent::RemoteCandidate(_))));
        server.join().unwrap();
    }
}
