//! Wire packet codec. Every Pinhole datagram starts with a 4-byte header
//! `[type:u8, flags:u8, seq:u16be]`; STUN traffic shares the socket and is
//! told apart by its magic cookie before this codec runs.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Hard ceiling for any datagram this library emits.
pub const P2P_MTU: usize = 1200;

/// Fixed header length.
pub const HEADER_LEN: usize = 4;

/// Header flag: last candidate batch (PEER_INFO) or graceful close marker.
pub const HDR_FLAG_FIN: u8 = 0x01;
/// Header flag: the compact server offers RELAY_DATA forwarding.
pub const HDR_FLAG_RELAY_SUPPORT: u8 = 0x02;

/// Packet types multiplexed over the session socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    // Compact signaling.
    Register = 0x01,
    RegisterAck = 0x02,
    PeerInfo = 0x03,
    PeerInfoAck = 0x04,
    Alive = 0x05,
    AliveAck = 0x06,
    NatProbe = 0x07,
    NatProbeAck = 0x08,
    Unregister = 0x09,
    PeerOff = 0x0A,
    RelayData = 0x0B,
    RelayAck = 0x0C,

    // NAT punch.
    Punch = 0x10,
    PunchAck = 0x11,
    Ping = 0x12,
    Pong = 0x13,

    // Data plane.
    Data = 0x20,
    Ack = 0x21,
    Fin = 0x22,
    Auth = 0x23,

    // Route layer.
    RouteProbe = 0x30,
    RouteProbeAck = 0x31,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Register,
            0x02 => Self::RegisterAck,
            0x03 => Self::PeerInfo,
            0x04 => Self::PeerInfoAck,
            0x05 => Self::Alive,
            0x06 => Self::AliveAck,
            0x07 => Self::NatProbe,
            0x08 => Self::NatProbeAck,
            0x09 => Self::Unregister,
            0x0A => Self::PeerOff,
            0x0B => Self::RelayData,
            0x0C => Self::RelayAck,
            0x10 => Self::Punch,
            0x11 => Self::PunchAck,
            0x12 => Self::Ping,
            0x13 => Self::Pong,
            0x20 => Self::Data,
            0x21 => Self::Ack,
            0x22 => Self::Fin,
            0x23 => Self::Auth,
            0x30 => Self::RouteProbe,
            0x31 => Self::RouteProbeAck,
            _ => return None,
        })
    }
}

/// Packet codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short for header ({0} bytes)")]
    TooShort(usize),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("packet would exceed the {P2P_MTU}-byte MTU ({0} bytes)")]
    Oversized(usize),
}

/// Decoded 4-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub flags: u8,
    pub seq: u16,
}

impl PacketHeader {
    /// Decode a header and return it with the remaining payload slice.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::TooShort(datagram.len()));
        }
        let mut cursor = datagram;
        let raw = cursor.get_u8();
        let ptype = PacketType::from_u8(raw).ok_or(PacketError::UnknownType(raw))?;
        let flags = cursor.get_u8();
        let seq = cursor.get_u16();
        Ok((Self { ptype, flags, seq }, cursor))
    }
}

/// Serialize a full datagram, enforcing the MTU.
pub fn encode_packet(
    ptype: PacketType,
    flags: u8,
    seq: u16,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let total = HEADER_LEN + payload.len();
    if total > P2P_MTU {
        return Err(PacketError::Oversized(total));
    }
    let mut buf = Vec::with_capacity(total);
    buf.put_u8(ptype as u8);
    buf.put_u8(flags);
    buf.put_u16(seq);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let pkt = encode_packet(PacketType::Punch, HDR_FLAG_FIN, 0xBEEF, b"hi").unwrap();
        let (hdr, payload) = PacketHeader::decode(&pkt).unwrap();
        assert_eq!(hdr.ptype, PacketType::Punch);
        assert_eq!(hdr.flags, HDR_FLAG_FIN);
        assert_eq!(hdr.seq, 0xBEEF);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn short_and_unknown_are_rejected() {
        assert_eq!(
            PacketHeader::decode(&[1, 2, 3]),
            Err(PacketError::TooShort(3))
        );
        assert_eq!(
            PacketHeader::decode(&[0xEE, 0, 0, 0]),
            Err(PacketError::UnknownType(0xEE))
        );
    }

    #[test]
    fn mtu_is_enforced() {
        let big = vec![0u8; P2P_MTU];
        assert!(matches!(
            encode_packet(PacketType::Data, 0, 0, &big),
            Err(PacketError::Oversized(_))
        ));
        let fit = vec![0u8; P2P_MTU - HEADER_LEN];
        assert!(encode_packet(PacketType::Data, 0, 0, &fit).is_ok());
    }
}
