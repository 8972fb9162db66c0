//! Session configuration. A `SessionConfig` is a plain value copied into the
//! session at creation time; mutating it afterwards has no effect on a live
//! session. A TOML loader is provided for driver programs.

use serde::Deserialize;
use std::{fs, path::Path};

use crate::error::{Error, Result};
use crate::lang::Language;

/// Which signaling back-end a session speaks. Exactly one variant is active
/// for a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalingMode {
    /// Single-socket UDP protocol with server-side offline caching.
    #[default]
    Compact,
    /// Long-lived TCP session with a relay server.
    Relay,
    /// Offer/answer through an external HTTP key-value store.
    Pubsub,
}

/// Primary configuration structure for a Pinhole session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling back-end used for candidate exchange.
    pub signaling_mode: SignalingMode,
    /// Signaling server host (compact and relay modes).
    pub server_host: Option<String>,
    /// Signaling server port.
    pub server_port: u16,

    /// Dedicated STUN server; defaults to the signaling server in compact mode.
    pub stun_server: Option<String>,
    pub stun_port: u16,
    /// Optional TURN server for relay candidates.
    pub turn_server: Option<String>,
    pub turn_port: u16,
    pub turn_user: Option<String>,
    pub turn_pass: Option<String>,

    /// Access token for the pubsub key-value store.
    pub gh_token: Option<String>,
    /// Document id for the pubsub key-value store.
    pub gist_id: Option<String>,

    /// Local peer identity announced over signaling.
    pub local_peer_id: Option<String>,
    /// UDP bind port; 0 lets the kernel choose.
    pub bind_port: u16,

    /// Enable the datagram-security transport (PSK engine by default).
    pub use_dtls: bool,
    /// Act as the handshake server when `use_dtls` is set.
    pub dtls_server: bool,
    /// Reserved: select an external ciphersuite engine instead of the
    /// built-in PSK engine.
    pub use_openssl: bool,
    /// Enable the AIMD congestion controller on top of the reliable layer.
    pub use_pseudotcp: bool,
    /// Enable the ICE connectivity checker.
    pub use_ice: bool,

    /// Do not promote the active path to the peer's host address even when
    /// same-subnet reachability is confirmed.
    pub disable_lan_shortcut: bool,
    /// Assume LAN reachability: skip the NAT probe and classify as open.
    pub lan_punch: bool,
    /// Gather only server-reflexive candidates.
    pub skip_host_candidates: bool,
    /// Log every punch transmission.
    pub verbose_nat_punch: bool,

    /// Delay small writes until a full payload accumulates.
    pub nagle: bool,
    /// Shared secret: AUTH packet payload and pubsub payload key.
    pub auth_key: Option<String>,
    /// Tick interval for the worker-thread mode, in milliseconds.
    pub update_interval_ms: u64,
    /// Log / message language.
    pub language: Language,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_mode: SignalingMode::Compact,
            server_host: None,
            server_port: default_server_port(),
            stun_server: None,
            stun_port: 3478,
            turn_server: None,
            turn_port: 3478,
            turn_user: None,
            turn_pass: None,
            gh_token: None,
            gist_id: None,
            local_peer_id: None,
            bind_port: 0,
            use_dtls: false,
            dtls_server: false,
            use_openssl: false,
            use_pseudotcp: false,
            use_ice: false,
            disable_lan_shortcut: false,
            lan_punch: false,
            skip_host_candidates: false,
            verbose_nat_punch: false,
            nagle: false,
            auth_key: None,
            update_interval_ms: 10,
            language: Language::En,
        }
    }
}

fn default_server_port() -> u16 {
    9000
}

impl SessionConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<SessionConfig>(&data)?;
        Ok(cfg)
    }

    /// Validate that the fields required by the selected signaling mode are
    /// present. Called by the session on `connect`.
    pub fn validate(&self) -> Result<()> {
        match self.signaling_mode {
            SignalingMode::Compact | SignalingMode::Relay => {
                if self.server_host.is_none() {
                    return Err(Error::config("server_host is required"));
                }
            }
            SignalingMode::Pubsub => {
                if self.gh_token.is_none() || self.gist_id.is_none() {
                    return Err(Error::config("gh_token and gist_id are required"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_compact() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.signaling_mode, SignalingMode::Compact);
        assert_eq!(cfg.bind_port, 0);
        assert!(!cfg.use_ice);
    }

    #[test]
    fn validate_requires_server_host() {
        let cfg = SessionConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = SessionConfig {
            server_host: Some("203.0.113.1".into()),
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_pubsub_requires_token_and_gist() {
        let cfg = SessionConfig {
            signaling_mode: SignalingMode::Pubsub,
            gh_token: Some("t".into()),
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "signaling_mode = \"relay\"\nserver_host = \"relay.example\"\nserver_port = 7000\nuse_ice = true"
        )
        .unwrap();
        let cfg = SessionConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.signaling_mode, SignalingMode::Relay);
        assert_eq!(cfg.server_port, 7000);
        assert!(cfg.use_ice);
    }
}
