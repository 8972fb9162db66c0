#![forbid(unsafe_code)]

//! Session layer of Pinhole: the per-peer orchestrator that drives
//! signaling, NAT traversal and the reliable byte stream over one UDP
//! socket, plus the optional worker-thread wrapper.
//!
//! The intended shape is `Session::create(config)` followed by
//! `connect(..)` and a `update()` loop at a 10 ms cadence; `SessionWorker`
//! runs that loop on an internal thread behind a single mutex for callers
//! that prefer blocking `send`/`recv`.

pub mod session;
pub mod worker;

pub use pinhole_core::{NatKind, PathKind, SessionConfig, SessionState, SignalingMode};
pub use session::{Session, SessionHooks};
pub use worker::SessionWorker;
