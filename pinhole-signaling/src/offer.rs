//! Common binary offer payload shared by the relay and pubsub variants.
//!
//! Layout (all multi-byte integers big-endian; addresses are carried as
//! their four network-order octets without further swapping):
//!
//! ```text
//! sender[32] target[32] timestamp:u32 delay_trigger:u32 count:u32
//! count x { type:u32 family:u32 port:u32 addr:u32 base_family:u32
//!           base_port:u32 base_addr:u32 priority:u32 }
//! ```

use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use pinhole_core::{Error, PeerId, Result};
use pinhole_transport::{Candidate, CandidateKind};

/// Offers never carry more than this many candidates.
pub const MAX_OFFER_CANDIDATES: usize = 8;

const FAMILY_IPV4: u32 = 1;
const CAND_FIELD_COUNT: usize = 8;

/// A candidate offer or answer exchanged through signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub sender: PeerId,
    pub target: PeerId,
    pub timestamp: u32,
    pub delay_trigger: u32,
    pub candidates: Vec<Candidate>,
}

fn kind_to_wire(kind: CandidateKind) -> u32 {
    match kind {
        CandidateKind::Host => 0,
        CandidateKind::ServerReflexive => 1,
        CandidateKind::PeerReflexive => 2,
        CandidateKind::Relay => 3,
    }
}

fn kind_from_wire(value: u32) -> Result<CandidateKind> {
    Ok(match value {
        0 => CandidateKind::Host,
        1 => CandidateKind::ServerReflexive,
        2 => CandidateKind::PeerReflexive,
        3 => CandidateKind::Relay,
        other => return Err(Error::protocol(format!("bad candidate type {other}"))),
    })
}

impl Offer {
    pub fn encode(&self) -> Vec<u8> {
        let count = self.candidates.len().min(MAX_OFFER_CANDIDATES);
        let mut buf = Vec::with_capacity(76 + count * CAND_FIELD_COUNT * 4);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.target.as_bytes());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.delay_trigger);
        buf.put_u32(count as u32);
        for cand in self.candidates.iter().take(count) {
            buf.put_u32(kind_to_wire(cand.kind));
            buf.put_u32(FAMILY_IPV4);
            buf.put_u32(cand.addr.port() as u32);
            buf.extend_from_slice(&cand.addr.ip().octets());
            match cand.base {
                Some(base) => {
                    buf.put_u32(FAMILY_IPV4);
                    buf.put_u32(base.port() as u32);
                    buf.extend_from_slice(&base.ip().octets());
                }
                None => {
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.extend_from_slice(&[0u8; 4]);
                }
            }
            buf.put_u32(cand.priority);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 76 {
            return Err(Error::protocol(format!("short offer: {}", data.len())));
        }
        let mut cursor = data;
        let sender = PeerId::from_bytes(&cursor[..32]);
        cursor.advance(32);
        let target = PeerId::from_bytes(&cursor[..32]);
        cursor.advance(32);
        let timestamp = cursor.get_u32();
        let delay_trigger = cursor.get_u32();
        let count = cursor.get_u32() as usize;
        if count > MAX_OFFER_CANDIDATES {
            return Err(Error::protocol(format!("offer candidate count {count}")));
        }
        if cursor.len() < count * CAND_FIELD_COUNT * 4 {
            return Err(Error::protocol("truncated offer candidates"));
        }
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = kind_from_wire(cursor.get_u32())?;
            let family = cursor.get_u32();
            let port = cursor.get_u32() as u16;
            let mut octets = [0u8; 4];
            cursor.copy_to_slice(&mut octets);
            let base_family = cursor.get_u32();
            let base_port = cursor.get_u32() as u16;
            let mut base_octets = [0u8; 4];
            cursor.copy_to_slice(&mut base_octets);
            let priority = cursor.get_u32();
            if family != FAMILY_IPV4 {
                return Err(Error::protocol(format!("bad address family {family}")));
            }
            let base = (base_family == FAMILY_IPV4)
                .then(|| SocketAddrV4::new(Ipv4Addr::from(base_octets), base_port));
            candidates.push(Candidate {
                kind,
                addr: SocketAddrV4::new(Ipv4Addr::from(octets), port),
                priority,
                base,
            });
        }
        Ok(Self {
            sender,
            target,
            timestamp,
            delay_trigger,
            candidates,
        })
    }
}
