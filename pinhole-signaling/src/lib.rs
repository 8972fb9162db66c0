#![forbid(unsafe_code)]

//! Signaling back-ends for Pinhole. Each variant delivers the same two
//! things to the session core: a bag of remote candidates (ordered by
//! arrival, deduplicated by address) and, for passive sessions, the learned
//! remote peer id. All variants tolerate re-delivery, partial delivery and
//! reordering.

pub mod compact;
pub mod offer;
pub mod pubsub;
pub mod relay;

use std::net::SocketAddrV4;

use pinhole_core::PeerId;
use pinhole_transport::Candidate;

/// Facts a signaling variant reports up to the session orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// A remote candidate arrived (the session dedups on admission).
    RemoteCandidate(Candidate),
    /// The peer finished sending its candidate set.
    RemoteCandidatesDone,
    /// The remote peer id was learned (passive sessions).
    PeerLearned(PeerId),
    /// Our public mapping as observed by the signaling server.
    PublicAddr(SocketAddrV4),
    /// NAT probe finished: the mapping seen by the server's probe port, or
    /// `None` when every probe timed out.
    NatProbeResult(Option<SocketAddrV4>),
    /// The counterpart vanished; remote candidate state must be cleared.
    PeerOffline,
    /// The peer re-offered after a restart; ICE state must be reset before
    /// the fresh candidates are admitted.
    PeerReset(PeerId),
    /// Peers currently registered on the relay server.
    PeerList(Vec<PeerId>),
    /// Registration (or its equivalent) exhausted its retries.
    SignalingFailed(String),
    /// Server-relayed reliable payload (compact variant).
    RelayData { seq: u16, data: Vec<u8> },
    /// Server-relayed ack (compact variant).
    RelayAck { ack_seq: u16, sack_bits: u32 },
}
