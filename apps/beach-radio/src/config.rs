use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use thiserror::Error;

use crate::engine::{EngineConfig, IceServerConfig};
use crate::producer::{ProducerBackend, ProducerConfig, ProducerMode};

#[derive(Debug, Parser)]
#[command(
    name = "beach-radio",
    author,
    version,
    about = "Streams a server-side audio source to browsers over WebRTC"
)]
pub struct Cli {
    /// Address to bind the HTTP and WebSocket listener to.
    #[arg(long, env = "BEACH_RADIO_LISTEN_ADDR", default_value = "0.0.0.0:6080")]
    pub listen_addr: String,

    /// Stream a looped file instead of capturing live audio.
    #[arg(short = 't', long = "test", env = "BEACH_RADIO_TEST_MODE", default_value_t = false)]
    pub test_mode: bool,

    /// File looped in test mode.
    #[arg(long, env = "BEACH_RADIO_INPUT_FILE", default_value = "loop.mp3")]
    pub input_file: PathBuf,

    /// PulseAudio source captured outside test mode.
    #[arg(long, env = "BEACH_RADIO_CAPTURE_DEVICE", default_value = "default")]
    pub capture_device: String,

    #[arg(long, env = "BEACH_RADIO_PRODUCER", value_enum, default_value_t = ProducerBackend::Ffmpeg)]
    pub producer: ProducerBackend,

    /// Local UDP endpoint the producer streams RTP into. Port 0 picks one per session.
    #[arg(long, env = "BEACH_RADIO_PRODUCER_BIND", default_value = "127.0.0.1:0")]
    pub producer_bind: String,

    /// Comma separated STUN urls.
    #[arg(
        long,
        env = "BEACH_RADIO_STUN_SERVERS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub stun_servers: Vec<String>,

    #[arg(long, env = "BEACH_RADIO_TURN_URL")]
    pub turn_url: Option<String>,

    #[arg(long, env = "BEACH_RADIO_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "BEACH_RADIO_TURN_CREDENTIAL")]
    pub turn_credential: Option<String>,

    /// Only gather relay candidates. Requires a TURN server.
    #[arg(long, env = "BEACH_RADIO_RELAY_ONLY", default_value_t = false)]
    pub relay_only: bool,

    #[arg(long, env = "BEACH_RADIO_UDP_PORT_MIN")]
    pub udp_port_min: Option<u16>,

    #[arg(long, env = "BEACH_RADIO_UDP_PORT_MAX")]
    pub udp_port_max: Option<u16>,

    /// Directory holding the browser client.
    #[arg(long, env = "BEACH_RADIO_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Upper bound on concurrent sessions; unbounded when unset.
    #[arg(long, env = "BEACH_RADIO_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RADIO_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--udp-port-min and --udp-port-max must be given together")]
    PartialPortRange,
    #[error("udp port range {min}-{max} is empty")]
    EmptyPortRange { min: u16, max: u16 },
    #[error("--relay-only requires --turn-url")]
    RelayWithoutTurn,
    #[error("TURN username and credential must be given together")]
    PartialTurnCredentials,
    #[error("--max-sessions must be greater than zero")]
    ZeroMaxSessions,
}

#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub listen_addr: SocketAddr,
    pub producer: ProducerConfig,
    pub engine: EngineConfig,
    pub static_dir: Option<PathBuf>,
    pub max_sessions: Option<usize>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RadioConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let bind_addr: SocketAddr = cli
            .producer_bind
            .parse()
            .with_context(|| format!("invalid producer bind address: {}", cli.producer_bind))?;

        let udp_port_range = match (cli.udp_port_min, cli.udp_port_max) {
            (None, None) => None,
            (Some(min), Some(max)) if min <= max => Some((min, max)),
            (Some(min), Some(max)) => return Err(ConfigError::EmptyPortRange { min, max }.into()),
            _ => return Err(ConfigError::PartialPortRange.into()),
        };

        if cli.turn_username.is_some() != cli.turn_credential.is_some() {
            return Err(ConfigError::PartialTurnCredentials.into());
        }
        if cli.relay_only && cli.turn_url.is_none() {
            return Err(ConfigError::RelayWithoutTurn.into());
        }
        if cli.max_sessions == Some(0) {
            return Err(ConfigError::ZeroMaxSessions.into());
        }

        let mut ice_servers = Vec::new();
        let stun_urls: Vec<String> = cli
            .stun_servers
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if !stun_urls.is_empty() {
            ice_servers.push(IceServerConfig {
                urls: stun_urls,
                username: None,
                credential: None,
            });
        }
        if let Some(turn_url) = cli.turn_url {
            ice_servers.push(IceServerConfig {
                urls: vec![turn_url],
                username: cli.turn_username,
                credential: cli.turn_credential,
            });
        }

        let mode = if cli.test_mode {
            ProducerMode::LoopedFile(cli.input_file)
        } else {
            ProducerMode::Capture {
                device: cli.capture_device,
            }
        };

        Ok(RadioConfig {
            listen_addr,
            producer: ProducerConfig {
                backend: cli.producer,
                mode,
                bind_addr,
            },
            engine: EngineConfig {
                ice_servers,
                relay_only: cli.relay_only,
                udp_port_range,
                ..EngineConfig::default()
            },
            static_dir: cli.static_dir,
            max_sessions: cli.max_sessions,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
