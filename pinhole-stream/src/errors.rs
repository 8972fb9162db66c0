use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Stream-layer errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The 32-slot send window has no free entry; retry after acks arrive.
    #[error("reliable send window full")]
    WindowFull,
    /// A data packet payload was shorter than its fragment sub-header.
    #[error("truncated stream fragment ({0} bytes)")]
    TruncatedFragment(usize),
    /// A packet exceeded the per-packet stream payload limit.
    #[error("oversized stream fragment ({0} bytes)")]
    OversizedFragment(usize),
}
