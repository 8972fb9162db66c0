#![forbid(unsafe_code)]

//! Transport layer of Pinhole: the wire packet codec, the non-blocking UDP
//! socket, candidate management and the NAT traversal machinery (hole
//! punching, LAN routing, STUN/TURN, ICE-style connectivity checks and the
//! datagram-security engine contract).
//!
//! Every state machine in this crate is tick-driven and bounded per tick;
//! none of them owns the socket. Outgoing packets are produced through emit
//! callbacks so the session orchestrator keeps single ownership of the wire.

pub mod candidate;
pub mod ice;
pub mod packet;
pub mod punch;
pub mod route;
pub mod secure;
pub mod socket;
pub mod stun;

pub use candidate::{Candidate, CandidateKind, CandidateList, CandidatePair, PairState};
pub use ice::{IceChecker, IceEvent, IceRole, IceState};
pub use packet::{PacketHeader, PacketType, HEADER_LEN, P2P_MTU};
pub use punch::{NatPunch, PunchEvent, PunchState};
pub use route::RouteCtx;
pub use secure::{EngineOutput, PskEngine, SecurityEngine};
pub use socket::UdpChannel;
pub use stun::{classify_nat, is_stun, StunMessage, StunProbe, TurnAllocator};
