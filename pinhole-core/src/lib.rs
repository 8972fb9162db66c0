#![forbid(unsafe_code)]

//! Core types shared across the Pinhole workspace.
//!
//! This crate intentionally stays lightweight and pure Rust. It exports the
//! typed identifiers, the session configuration, basic error handling and
//! the process-wide language selector used by the other crates.

pub mod config;
pub mod error;
pub mod lang;
pub mod types;

pub use config::{SessionConfig, SignalingMode};
pub use error::{Error, Result};
pub use lang::Language;
pub use types::{NatKind, PathKind, PeerId, SessionState, TimestampMs};
