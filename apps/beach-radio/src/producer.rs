//! External audio producer: an ffmpeg or GStreamer child process that encodes
//! Opus and streams RTP into a session-private UDP endpoint.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use clap::ValueEnum;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::engine::{OPUS_CHANNELS, OPUS_CLOCK_RATE, OPUS_PAYLOAD_TYPE};
use crate::relay::{PacketSource, UdpPacketSource};

const OPUS_BITRATE: u32 = 128_000;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to bind producer endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProducerBackend {
    Ffmpeg,
    Gstreamer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerMode {
    /// Loop a local file forever, paced in real time.
    LoopedFile(PathBuf),
    /// Live capture from a PulseAudio source.
    Capture { device: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub backend: ProducerBackend,
    pub mode: ProducerMode,
    pub bind_addr: SocketAddr,
}

/// Program and argument vector streaming Opus RTP to `target`.
pub fn producer_command(config: &ProducerConfig, target: SocketAddr) -> (&'static str, Vec<String>) {
    match config.backend {
        ProducerBackend::Ffmpeg => ("ffmpeg", ffmpeg_args(&config.mode, target)),
        ProducerBackend::Gstreamer => ("gst-launch-1.0", gstreamer_args(&config.mode, target)),
    }
}

fn ffmpeg_args(mode: &ProducerMode, target: SocketAddr) -> Vec<String> {
    let mut args: Vec<String> = vec!["-re".into()];
    match mode {
        ProducerMode::LoopedFile(path) => {
            args.extend([
                "-stream_loop".into(),
                "-1".into(),
                "-i".into(),
                path.display().to_string(),
                "-acodec".into(),
                "libopus".into(),
                "-ar".into(),
                OPUS_CLOCK_RATE.to_string(),
                "-ac".into(),
                OPUS_CHANNELS.to_string(),
                "-b:a".into(),
                format!("{}k", OPUS_BITRATE / 1000),
                "-application".into(),
                "audio".into(),
            ]);
        }
        ProducerMode::Capture { device } => {
            args.extend([
                "-f".into(),
                "pulse".into(),
                "-i".into(),
                device.clone(),
                "-c:a".into(),
                "libopus".into(),
                "-frame_duration".into(),
                "40".into(),
                "-application".into(),
                "lowdelay".into(),
                "-ar".into(),
                OPUS_CLOCK_RATE.to_string(),
                "-ac".into(),
                OPUS_CHANNELS.to_string(),
                "-b:a".into(),
                format!("{}k", OPUS_BITRATE / 1000),
            ]);
        }
    }
    args.extend([
        "-payload_type".into(),
        OPUS_PAYLOAD_TYPE.to_string(),
        "-f".into(),
        "rtp".into(),
        format!("rtp://{target}"),
    ]);
    args
}

fn gstreamer_args(mode: &ProducerMode, target: SocketAddr) -> Vec<String> {
    let mut args: Vec<String> = vec!["-v".into(), "-e".into()];
    match mode {
        ProducerMode::LoopedFile(path) => {
            args.extend([
                "multifilesrc".into(),
                format!("location={}", path.display()),
                "loop=true".into(),
                "!".into(),
                "decodebin".into(),
                "!".into(),
            ]);
        }
        ProducerMode::Capture { device } => {
            args.extend(["pulsesrc".into(), format!("device={device}"), "!".into()]);
        }
    }
    args.extend([
        "audioconvert".into(),
        "!".into(),
        "audioresample".into(),
        "!".into(),
        "opusenc".into(),
        format!("bitrate={OPUS_BITRATE}"),
        "!".into(),
        "rtpopuspay".into(),
        format!("pt={OPUS_PAYLOAD_TYPE}"),
        "!".into(),
        "udpsink".into(),
        format!("host={}", target.ip()),
        format!("port={}", target.port()),
    ]);
    args
}

/// A running producer. Stopping consumes the handle, so it happens once.
#[async_trait]
pub trait ProducerHandle: Send {
    async fn stop(self: Box<Self>);
}

#[async_trait]
pub trait ProducerLauncher: Send + Sync {
    async fn start(
        &self,
    ) -> Result<(Box<dyn ProducerHandle>, Box<dyn PacketSource>), ProducerError>;
}

pub struct ProcessLauncher {
    config: ProducerConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProducerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProducerLauncher for ProcessLauncher {
    async fn start(
        &self,
    ) -> Result<(Box<dyn ProducerHandle>, Box<dyn PacketSource>), ProducerError> {
        let bind_addr = self.config.bind_addr;
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| ProducerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let target = socket.local_addr().map_err(|source| ProducerError::Bind {
            addr: bind_addr,
            source,
        })?;

        let (program, args) = producer_command(&self.config, target);
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProducerError::Spawn { program, source })?;

        let pid = child.id();
        info!(program, pid, %target, "producer started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => debug!(program, "{line}"),
                        Ok(None) => break,
                        Err(err) => {
                            debug!(program, error = %err, "producer stderr read failed");
                            break;
                        }
                    }
                }
            });
        }

        Ok((
            Box::new(ProcessHandle { program, child }),
            Box::new(UdpPacketSource::new(socket)),
        ))
    }
}

struct ProcessHandle {
    program: &'static str,
    child: Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    AlreadyExited(ExitStatus),
    Killed(ExitStatus),
}

impl ProcessHandle {
    /// Kills the child unless it has already exited, then reaps it.
    async fn terminate(&mut self) -> io::Result<Termination> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Termination::AlreadyExited(status));
        }
        self.child.kill().await?;
        let status = self.child.wait().await?;
        Ok(Termination::Killed(status))
    }
}

#[async_trait]
impl ProducerHandle for ProcessHandle {
    async fn stop(mut self: Box<Self>) {
        let program = self.program;
        match self.terminate().await {
            Ok(Termination::AlreadyExited(status)) => {
                debug!(program, %status, "producer already exited")
            }
            Ok(Termination::Killed(status)) => info!(program, %status, "producer stopped"),
            Err(err) => warn!(program, error = %err, "failed to stop producer"),
        }
    }
}
