//! STUN (RFC 5389) client support: binding requests for server-reflexive
//! discovery, a minimal TURN (RFC 5766) Allocate for relay candidates, and
//! the reduced single-server NAT classification.
//!
//! Only IPv4 is supported. MESSAGE-INTEGRITY uses HMAC-SHA1 over the
//! encoded prefix and FINGERPRINT is CRC-32 XOR `0x5354554E`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;
use tracing::{debug, warn};

use pinhole_core::NatKind;

use crate::route::LocalNet;

/// STUN magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const FINGERPRINT_XOR: u32 = 0x5354_554E;
const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Binding/probe retransmit interval and attempt cap.
const RETRY_INTERVAL_MS: u64 = 1_000;
const MAX_ATTEMPTS: u32 = 3;

/// STUN protocol errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("message parse error: {0}")]
    Parse(String),
    #[error("unsupported address family")]
    UnsupportedFamily,
    #[error("transaction id mismatch")]
    TransactionMismatch,
}

type StunResult<T> = Result<T, StunError>;

/// Message types this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateErrorResponse = 0x0113,
}

impl MessageType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingErrorResponse),
            0x0003 => Some(Self::AllocateRequest),
            0x0103 => Some(Self::AllocateResponse),
            0x0113 => Some(Self::AllocateErrorResponse),
            _ => None,
        }
    }
}

/// Attribute types this client reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,
    XorRelayedAddress = 0x0016,
    Lifetime = 0x000D,
    RequestedTransport = 0x0019,
    Fingerprint = 0x8028,
}

/// Quick check for STUN traffic sharing the session socket: at least a full
/// header and the magic cookie in bytes 4..8.
pub fn is_stun(datagram: &[u8]) -> bool {
    datagram.len() >= 20 && datagram[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// A parsed or under-construction STUN message.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub message_type: MessageType,
    pub transaction_id: [u8; 12],
    attributes: Vec<(u16, Bytes)>,
}

impl StunMessage {
    /// New request with a random transaction id.
    pub fn new(message_type: MessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attr_type: AttributeType, value: Bytes) {
        self.attributes.push((attr_type as u16, value));
    }

    pub fn add_username(&mut self, username: &str) {
        self.add_attribute(
            AttributeType::Username,
            Bytes::copy_from_slice(username.as_bytes()),
        );
    }

    pub fn add_realm(&mut self, realm: &str) {
        self.add_attribute(
            AttributeType::Realm,
            Bytes::copy_from_slice(realm.as_bytes()),
        );
    }

    pub fn add_nonce(&mut self, nonce: &str) {
        self.add_attribute(
            AttributeType::Nonce,
            Bytes::copy_from_slice(nonce.as_bytes()),
        );
    }

    pub fn add_lifetime(&mut self, seconds: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(seconds);
        self.add_attribute(AttributeType::Lifetime, buf.freeze());
    }

    /// REQUESTED-TRANSPORT, protocol 17 = UDP.
    pub fn add_requested_transport_udp(&mut self) {
        self.add_attribute(
            AttributeType::RequestedTransport,
            Bytes::from_static(&[17, 0, 0, 0]),
        );
    }

    /// HMAC-SHA1 over the message as encoded so far.
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        let encoded = self.encode();
        type HmacSha1 = Hmac<Sha1>;
        let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
            return;
        };
        mac.update(&encoded);
        let digest = mac.finalize().into_bytes();
        self.add_attribute(
            AttributeType::MessageIntegrity,
            Bytes::copy_from_slice(&digest),
        );
    }

    /// CRC-32 of the message so far, XORed with the STUN constant.
    pub fn add_fingerprint(&mut self) {
        let encoded = self.encode();
        let fp = CRC32.checksum(&encoded) ^ FINGERPRINT_XOR;
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(fp);
        self.add_attribute(AttributeType::Fingerprint, buf.freeze());
    }

    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type as u16)
            .map(|(_, v)| v)
    }

    fn get_text(&self, attr_type: AttributeType) -> Option<String> {
        self.get_attribute(attr_type)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn get_xor_mapped_address(&self) -> StunResult<Option<SocketAddrV4>> {
        match self.get_attribute(AttributeType::XorMappedAddress) {
            Some(v) => decode_xor_address(v).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_xor_relayed_address(&self) -> StunResult<Option<SocketAddrV4>> {
        match self.get_attribute(AttributeType::XorRelayedAddress) {
            Some(v) => decode_xor_address(v).map(Some),
            None => Ok(None),
        }
    }

    /// Serialize header and attributes with 4-byte padding.
    pub fn encode(&self) -> Vec<u8> {
        let attrs_len: usize = self
            .attributes
            .iter()
            .map(|(_, v)| 4 + (v.len() + 3) / 4 * 4)
            .sum();
        let mut buf = BytesMut::with_capacity(20 + attrs_len);
        buf.put_u16(self.message_type as u16);
        buf.put_u16(attrs_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        for (attr_type, value) in &self.attributes {
            buf.put_u16(*attr_type);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
            buf.put_bytes(0, (4 - value.len() % 4) % 4);
        }
        buf.to_vec()
    }

    /// Parse a datagram. Unknown attributes are kept raw so callers can
    /// ignore them.
    pub fn decode(data: &[u8]) -> StunResult<Self> {
        if data.len() < 20 {
            return Err(StunError::Parse(format!("short message: {}", data.len())));
        }
        let mut cursor = data;
        let raw_type = cursor.get_u16();
        let message_type = MessageType::from_u16(raw_type)
            .ok_or_else(|| StunError::Parse(format!("unknown type {raw_type:#06x}")))?;
        let length = cursor.get_u16() as usize;
        let magic = cursor.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::Parse("bad magic cookie".into()));
        }
        let mut transaction_id = [0u8; 12];
        cursor.copy_to_slice(&mut transaction_id);

        let mut attributes = Vec::new();
        let mut remaining = length.min(cursor.len());
        while remaining >= 4 && cursor.len() >= 4 {
            let attr_type = cursor.get_u16();
            let attr_len = cursor.get_u16() as usize;
            if cursor.len() < attr_len {
                return Err(StunError::Parse("truncated attribute".into()));
            }
            attributes.push((attr_type, Bytes::copy_from_slice(&cursor[..attr_len])));
            cursor.advance(attr_len);
            let padding = ((4 - attr_len % 4) % 4).min(cursor.len());
            cursor.advance(padding);
            remaining = remaining.saturating_sub(4 + attr_len + padding);
        }
        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }
}

fn decode_xor_address(value: &[u8]) -> StunResult<SocketAddrV4> {
    if value.len() < 8 {
        return Err(StunError::Parse("short xor address".into()));
    }
    let mut cursor = value;
    cursor.advance(1); // reserved
    let family = cursor.get_u8();
    if family != 0x01 {
        return Err(StunError::UnsupportedFamily);
    }
    let port = cursor.get_u16() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = cursor.get_u32() ^ MAGIC_COOKIE;
    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// Tick-driven STUN binding probe used to gather the server-reflexive
/// candidate. Sends up to three requests a second apart and records the
/// XOR-MAPPED-ADDRESS of the first matching response.
pub struct StunProbe {
    server: SocketAddrV4,
    request: StunMessage,
    attempts: u32,
    last_send_ms: u64,
    mapped: Option<SocketAddrV4>,
    failed: bool,
}

impl StunProbe {
    pub fn new(server: SocketAddrV4) -> Self {
        Self {
            server,
            request: StunMessage::new(MessageType::BindingRequest),
            attempts: 0,
            last_send_ms: 0,
            mapped: None,
            failed: false,
        }
    }

    /// Short-term-credential variant used for ICE-authenticated servers.
    pub fn with_short_term(server: SocketAddrV4, ufrag: &str, password: &str) -> Self {
        let mut request = StunMessage::new(MessageType::BindingRequest);
        request.add_username(ufrag);
        request.add_message_integrity(password.as_bytes());
        request.add_fingerprint();
        Self {
            server,
            request,
            attempts: 0,
            last_send_ms: 0,
            mapped: None,
            failed: false,
        }
    }

    pub fn mapped(&self) -> Option<SocketAddrV4> {
        self.mapped
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn done(&self) -> bool {
        self.mapped.is_some() || self.failed
    }

    /// Retransmit when due; marks the probe failed after the attempt cap.
    pub fn tick(&mut self, now_ms: u64, mut emit: impl FnMut(SocketAddrV4, Vec<u8>)) {
        if self.done() {
            return;
        }
        if self.attempts > 0 && now_ms.saturating_sub(self.last_send_ms) < RETRY_INTERVAL_MS {
            return;
        }
        if self.attempts >= MAX_ATTEMPTS {
            debug!(server = %self.server, "stun binding timed out");
            self.failed = true;
            return;
        }
        emit(self.server, self.request.encode());
        self.attempts += 1;
        self.last_send_ms = now_ms;
    }

    /// Feed a STUN datagram. Returns the mapped address when this response
    /// completes the probe.
    pub fn on_datagram(&mut self, data: &[u8]) -> Option<SocketAddrV4> {
        if self.done() {
            return None;
        }
        let msg = match StunMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "ignoring bad stun datagram");
                return None;
            }
        };
        if msg.transaction_id != self.request.transaction_id {
            return None;
        }
        if msg.message_type != MessageType::BindingResponse {
            self.failed = true;
            return None;
        }
        match msg.get_xor_mapped_address() {
            Ok(Some(addr)) => {
                self.mapped = Some(addr);
                Some(addr)
            }
            _ => {
                self.failed = true;
                None
            }
        }
    }
}

/// Allocate phases for the minimal TURN client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocPhase {
    /// First attempt, no credentials yet.
    Anonymous,
    /// Retrying with the realm/nonce the server handed back.
    Authenticated,
    Done,
    Failed,
}

/// Minimal RFC 5766 Allocate: one anonymous attempt, then one
/// long-term-credential retry. The relayed address feeds the candidate
/// list; relayed data forwarding is not part of this client.
pub struct TurnAllocator {
    server: SocketAddrV4,
    username: String,
    password: String,
    request: StunMessage,
    phase: AllocPhase,
    attempts: u32,
    last_send_ms: u64,
    relayed: Option<SocketAddrV4>,
}

impl TurnAllocator {
    pub fn new(server: SocketAddrV4, username: &str, password: &str) -> Self {
        let mut request = StunMessage::new(MessageType::AllocateRequest);
        request.add_requested_transport_udp();
        request.add_lifetime(600);
        Self {
            server,
            username: username.to_string(),
            password: password.to_string(),
            request,
            phase: AllocPhase::Anonymous,
            attempts: 0,
            last_send_ms: 0,
            relayed: None,
        }
    }

    pub fn relayed(&self) -> Option<SocketAddrV4> {
        self.relayed
    }

    pub fn done(&self) -> bool {
        matches!(self.phase, AllocPhase::Done | AllocPhase::Failed)
    }

    pub fn tick(&mut self, now_ms: u64, mut emit: impl FnMut(SocketAddrV4, Vec<u8>)) {
        if self.done() {
            return;
        }
        if self.attempts > 0 && now_ms.saturating_sub(self.last_send_ms) < RETRY_INTERVAL_MS {
            return;
        }
        if self.attempts >= MAX_ATTEMPTS {
            debug!(server = %self.server, "turn allocate timed out");
            self.phase = AllocPhase::Failed;
            return;
        }
        emit(self.server, self.request.encode());
        self.attempts += 1;
        self.last_send_ms = now_ms;
    }

    /// Feed a STUN datagram; returns the relayed address on success.
    pub fn on_datagram(&mut self, data: &[u8]) -> Option<SocketAddrV4> {
        if self.done() {
            return None;
        }
        let msg = StunMessage::decode(data).ok()?;
        if msg.transaction_id != self.request.transaction_id {
            return None;
        }
        match msg.message_type {
            MessageType::AllocateResponse => match msg.get_xor_relayed_address() {
                Ok(Some(addr)) => {
                    self.phase = AllocPhase::Done;
                    self.relayed = Some(addr);
                    Some(addr)
                }
                _ => {
                    self.phase = AllocPhase::Failed;
                    None
                }
            },
            MessageType::AllocateErrorResponse => {
                if self.phase == AllocPhase::Anonymous {
                    let realm = msg.get_text(AttributeType::Realm);
                    let nonce = msg.get_text(AttributeType::Nonce);
                    if let (Some(realm), Some(nonce)) = (realm, nonce) {
                        self.begin_authenticated(realm, nonce);
                        return None;
                    }
                }
                self.phase = AllocPhase::Failed;
                None
            }
            _ => None,
        }
    }

    fn begin_authenticated(&mut self, realm: String, nonce: String) {
        let mut request = StunMessage::new(MessageType::AllocateRequest);
        request.add_requested_transport_udp();
        request.add_lifetime(600);
        request.add_username(&self.username);
        request.add_realm(&realm);
        request.add_nonce(&nonce);
        request.add_message_integrity(self.password.as_bytes());
        self.request = request;
        self.phase = AllocPhase::Authenticated;
        self.attempts = 0;
        self.last_send_ms = 0;
    }
}

/// Reduced single-server NAT classification.
///
/// `public1` is the mapping observed by the server's main port, `public2`
/// the mapping observed by its probe port (`None` when the probe timed
/// out). With one server IP the three cone sub-types collapse into one.
pub fn classify_nat(
    locals: &[LocalNet],
    public1: SocketAddrV4,
    public2: Option<SocketAddrV4>,
    lan_punch: bool,
) -> NatKind {
    if lan_punch {
        return NatKind::Open;
    }
    if locals.iter().any(|n| n.addr == *public1.ip()) {
        return NatKind::Open;
    }
    match public2 {
        Some(p2) if p2.port() == public1.port() => NatKind::Cone,
        Some(_) => NatKind::Symmetric,
        None => NatKind::Unsupported,
    }
}
