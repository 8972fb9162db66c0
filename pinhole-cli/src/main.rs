#![forbid(unsafe_code)]

//! Reference driver: wires command line flags into a `SessionConfig`,
//! drives the update loop and bridges stdin/stdout to the peer stream.

use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use pinhole_core::{Language, SessionConfig, SessionState, SignalingMode};
use pinhole_session::Session;

#[derive(Parser, Debug)]
#[command(name = "pinhole", about = "Peer-to-peer session tool", version)]
struct Args {
    /// Enable datagram encryption (built-in PSK engine).
    #[arg(long)]
    dtls: bool,
    /// Use an external ciphersuite engine instead of the PSK one.
    #[arg(long)]
    openssl: bool,
    /// Enable the pseudo-TCP congestion controller.
    #[arg(long = "pseudo")]
    pseudo_tcp: bool,
    /// Use the compact UDP signaling protocol.
    #[arg(long)]
    compact: bool,
    /// Signaling server, host or host:port.
    #[arg(long)]
    server: Option<String>,
    /// Access token for pubsub signaling.
    #[arg(long = "github", value_name = "TOKEN")]
    github_token: Option<String>,
    /// Document id for pubsub signaling.
    #[arg(long = "gist", value_name = "ID")]
    gist_id: Option<String>,
    /// Local peer name.
    #[arg(long)]
    name: Option<String>,
    /// Target peer name; omit to wait for an incoming connection.
    #[arg(long)]
    to: Option<String>,
    /// Never promote the path to the peer's LAN address.
    #[arg(long = "disable-lan")]
    disable_lan: bool,
    /// Assume LAN reachability and skip NAT probing.
    #[arg(long = "lan-punch")]
    lan_punch: bool,
    /// Gather only server-reflexive candidates.
    #[arg(long = "public-only")]
    public_only: bool,
    /// Log every punch transmission.
    #[arg(long = "verbose-punch")]
    verbose_punch: bool,
    /// Verbose logging.
    #[arg(long, short)]
    verbose: bool,
    /// Echo whatever the peer sends back to it.
    #[arg(long)]
    echo: bool,
    /// Chinese diagnostics.
    #[arg(long)]
    cn: bool,
    /// TURN server for relay candidates.
    #[arg(long)]
    turn: Option<String>,
    #[arg(long = "turn-user")]
    turn_user: Option<String>,
    #[arg(long = "turn-pass")]
    turn_pass: Option<String>,
    /// Shared secret for AUTH and payload encryption.
    #[arg(long = "key")]
    auth_key: Option<String>,
    /// Load a TOML session config; flags override its fields.
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,
}

fn split_host_port(spec: &str, default_port: u16) -> (String, u16) {
    match spec.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (spec.to_string(), default_port),
        },
        None => (spec.to_string(), default_port),
    }
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let base = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    let mut cfg = SessionConfig {
        use_dtls: args.dtls || base.use_dtls,
        use_openssl: args.openssl || base.use_openssl,
        use_pseudotcp: args.pseudo_tcp || base.use_pseudotcp,
        use_ice: true,
        disable_lan_shortcut: args.disable_lan || base.disable_lan_shortcut,
        lan_punch: args.lan_punch || base.lan_punch,
        skip_host_candidates: args.public_only || base.skip_host_candidates,
        verbose_nat_punch: args.verbose_punch || base.verbose_nat_punch,
        local_peer_id: args.name.clone().or(base.local_peer_id.clone()),
        auth_key: args.auth_key.clone().or(base.auth_key.clone()),
        language: if args.cn { Language::Zh } else { base.language },
        // The passive side of a DTLS pair answers the handshake.
        dtls_server: args.to.is_none(),
        ..base
    };

    if args.github_token.is_some() || args.gist_id.is_some() {
        cfg.signaling_mode = SignalingMode::Pubsub;
        cfg.gh_token = args.github_token.clone();
        cfg.gist_id = args.gist_id.clone();
    } else if let Some(server) = &args.server {
        cfg.signaling_mode = if args.compact {
            SignalingMode::Compact
        } else {
            SignalingMode::Relay
        };
        let (host, port) = split_host_port(server, cfg.server_port);
        cfg.server_host = Some(host);
        cfg.server_port = port;
    } else if cfg.validate().is_err() {
        // Nothing on the command line and nothing usable in the file.
        bail!("no signaling mode: pass --server (with optional --compact) or --github/--gist");
    }

    if let Some(turn) = &args.turn {
        let (host, port) = split_host_port(turn, cfg.turn_port);
        cfg.turn_server = Some(host);
        cfg.turn_port = port;
        cfg.turn_user = args.turn_user.clone();
        cfg.turn_pass = args.turn_pass.clone();
    }
    Ok(cfg)
}

fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let mut session = Session::create(config).context("session init failed")?;
    session
        .connect(args.to.as_deref())
        .context("connect failed")?;
    info!(
        id = %session.local_id(),
        port = session.local_port(),
        "session started"
    );

    let lines = stdin_lines();
    let mut announced = false;
    let mut buf = [0u8; 4096];
    loop {
        session.update().context("session error")?;
        match session.state() {
            SessionState::Closed => break,
            SessionState::Error => bail!("session failed"),
            _ => {}
        }

        if session.is_ready() && !announced {
            announced = true;
            info!(path = ?session.path(), addr = ?session.active_addr(), "peer connected");
        }

        let n = session.recv(&mut buf)?;
        if n > 0 {
            if args.echo {
                let mut sent = 0;
                while sent < n {
                    sent += session.send(&buf[sent..n])?;
                }
            } else {
                let mut out = std::io::stdout().lock();
                out.write_all(&buf[..n])?;
                out.flush()?;
            }
        }

        if session.is_ready() {
            while let Ok(line) = lines.try_recv() {
                let mut data = line.into_bytes();
                data.push(b'\n');
                let mut sent = 0;
                while sent < data.len() {
                    let queued = session.send(&data[sent..])?;
                    if queued == 0 {
                        warn!("send ring full, backing off");
                        break;
                    }
                    sent += queued;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
    session.close();
    Ok(())
}

fn main() {
    let args = Args::parse();
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args) {
        eprintln!("pinhole: {e:#}");
        std::process::exit(1);
    }
}
