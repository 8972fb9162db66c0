//! Route layer: enumerate local IPv4 interfaces, recognize a peer on the
//! same subnet and confirm direct LAN reachability with a ROUTE_PROBE
//! exchange so the orchestrator can short-circuit the path to the peer's
//! host address.

use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

use crate::packet::PacketType;

/// One usable local interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNet {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl LocalNet {
    fn contains(&self, other: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(self.addr) & mask) == (u32::from(other) & mask)
    }
}

/// Enumerate non-loopback, up IPv4 interfaces as `(address, netmask)` pairs.
pub fn detect_local() -> Vec<LocalNet> {
    let mut nets = Vec::new();
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            for iface in ifaces {
                if iface.is_loopback() {
                    continue;
                }
                if let get_if_addrs::IfAddr::V4(v4) = iface.addr {
                    nets.push(LocalNet {
                        addr: v4.ip,
                        mask: v4.netmask,
                    });
                }
            }
        }
        Err(e) => warn!(error = %e, "interface enumeration failed"),
    }
    nets
}

/// LAN-shortcut state for one session.
#[derive(Debug, Default)]
pub struct RouteCtx {
    locals: Vec<LocalNet>,
    /// Confirmed same-subnet peer address, set by ROUTE_PROBE_ACK.
    lan_confirmed: Option<SocketAddrV4>,
}

impl RouteCtx {
    pub fn new() -> Self {
        Self {
            locals: detect_local(),
            lan_confirmed: None,
        }
    }

    /// Construct with a fixed interface list (tests).
    pub fn with_locals(locals: Vec<LocalNet>) -> Self {
        Self {
            locals,
            lan_confirmed: None,
        }
    }

    pub fn locals(&self) -> &[LocalNet] {
        &self.locals
    }

    /// True when some local interface shares a subnet with `peer`.
    pub fn same_subnet(&self, peer: Ipv4Addr) -> bool {
        self.locals.iter().any(|n| n.contains(peer))
    }

    /// Send a ROUTE_PROBE to the peer's private address. The 2-byte payload
    /// carries our data port so the peer can answer the right socket.
    pub fn send_probe(
        &self,
        peer_priv: SocketAddrV4,
        local_port: u16,
        mut emit: impl FnMut(SocketAddrV4, PacketType, Vec<u8>),
    ) {
        let mut payload = Vec::with_capacity(2);
        payload.put_u16(local_port);
        debug!(%peer_priv, "route probe");
        emit(peer_priv, PacketType::RouteProbe, payload);
    }

    /// Answer an incoming ROUTE_PROBE.
    pub fn on_probe(
        &self,
        from: SocketAddrV4,
        payload: &[u8],
        mut emit: impl FnMut(SocketAddrV4, PacketType, Vec<u8>),
    ) {
        let mut reply_to = from;
        if payload.len() >= 2 {
            let mut cursor = payload;
            reply_to.set_port(cursor.get_u16());
        }
        emit(reply_to, PacketType::RouteProbeAck, Vec::new());
    }

    /// Record LAN confirmation from a ROUTE_PROBE_ACK.
    pub fn on_probe_ack(&mut self, from: SocketAddrV4) {
        if self.lan_confirmed.is_none() {
            debug!(%from, "lan path confirmed");
        }
        self.lan_confirmed = Some(from);
    }

    pub fn lan_confirmed(&self) -> Option<SocketAddrV4> {
        self.lan_confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RouteCtx {
        RouteCtx::with_locals(vec![LocalNet {
            addr: Ipv4Addr::new(192, 168, 1, 10),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }])
    }

    #[test]
    fn same_subnet_uses_mask() {
        let ctx = ctx();
        assert!(ctx.same_subnet(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!ctx.same_subnet(Ipv4Addr::new(192, 168, 2, 77)));
        assert!(!ctx.same_subnet(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn probe_carries_local_port() {
        let ctx = ctx();
        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 6000);
        let mut out = Vec::new();
        ctx.send_probe(peer, 5123, |a, t, p| out.push((a, t, p)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, PacketType::RouteProbe);
        assert_eq!(out[0].2, vec![0x14, 0x03]); // 5123 big-endian
    }

    #[test]
    fn probe_reply_targets_advertised_port() {
        let ctx = ctx();
        let from = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 40000);
        let mut out = Vec::new();
        ctx.on_probe(from, &[0x14, 0x03], |a, t, _| out.push((a, t)));
        assert_eq!(out[0].0.port(), 5123);
        assert_eq!(out[0].1, PacketType::RouteProbeAck);
    }

    #[test]
    fn ack_confirms_lan() {
        let mut ctx = ctx();
        assert!(ctx.lan_confirmed().is_none());
        let from = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 6000);
        ctx.on_probe_ack(from);
        assert_eq!(ctx.lan_confirmed(), Some(from));
    }
}
