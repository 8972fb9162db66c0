#![forbid(unsafe_code)]

//! Byte-stream layer of Pinhole: ring buffers, the fragmenting framer, the
//! 32-slot reliable ARQ and the optional AIMD congestion controller.
//!
//! Nothing in this crate touches a socket. The session orchestrator owns the
//! wire; this crate produces and consumes packet payloads through small
//! callback seams so the same machinery serves the direct and the relayed
//! path.

pub mod congestion;
pub mod errors;
pub mod framer;
pub mod reliable;
pub mod ring;

pub use congestion::Congestion;
pub use errors::{Error, Result};
pub use framer::{StreamBuffer, STREAM_PAYLOAD};
pub use reliable::{seq_diff, AckSummary, Reliable, RELIABLE_WINDOW};
pub use ring::ByteRing;
