use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the session core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("resolve: {0}")]
    Resolve(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("signaling: {0}")]
    Signaling(String),
    #[error("peer heartbeat lost")]
    HeartbeatLost,
    #[error("authentication rejected")]
    AuthRejected,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn signaling(msg: impl Into<String>) -> Self {
        Self::Signaling(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
