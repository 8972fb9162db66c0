//! Non-blocking UDP channel owned by a session. `SO_REUSEADDR` is set so a
//! restarted process can reclaim its port while old punch bindings drain.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::trace;

use pinhole_core::Result;

use crate::packet::{encode_packet, PacketType, P2P_MTU};

/// One UDP socket shared by the data plane, compact signaling and STUN.
pub struct UdpChannel {
    sock: UdpSocket,
    local_port: u16,
}

impl UdpChannel {
    /// Bind to the given port (0 lets the kernel pick one).
    pub fn bind(port: u16) -> Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        raw.set_nonblocking(true)?;
        let sock: UdpSocket = raw.into();
        let local_port = match sock.local_addr()? {
            SocketAddr::V4(a) => a.port(),
            SocketAddr::V6(a) => a.port(),
        };
        Ok(Self { sock, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Non-blocking receive. `Ok(None)` means the queue is drained.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>> {
        match self.sock.recv_from(buf) {
            Ok((n, SocketAddr::V4(from))) => Ok(Some((n, from))),
            // IPv6 is out of scope; silently skip the datagram.
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send a raw datagram (STUN traffic bypasses the packet codec).
    pub fn send_raw(&self, addr: SocketAddrV4, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= P2P_MTU);
        self.sock.send_to(data, SocketAddr::V4(addr))?;
        Ok(())
    }

    /// Serialize and send one protocol packet.
    pub fn send_packet(
        &self,
        addr: SocketAddrV4,
        ptype: PacketType,
        flags: u8,
        seq: u16,
        payload: &[u8],
    ) -> Result<()> {
        let pkt = encode_packet(ptype, flags, seq, payload)
            .map_err(|e| pinhole_core::Error::protocol(e.to_string()))?;
        trace!(?ptype, %addr, len = pkt.len(), "tx");
        self.sock.send_to(&pkt, SocketAddr::V4(addr))?;
        Ok(())
    }
}
