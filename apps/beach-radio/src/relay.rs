//! Packet relay between the external producer and the outbound WebRTC track.
//!
//! Two pumps run per session. The forward pump reads RTP datagrams from the
//! producer's endpoint and writes them to the outbound track in arrival order.
//! The feedback pump keeps reading RTCP from the track's sender so the
//! engine's NACK and report interceptors see the traffic. Both stop the moment
//! the session's cancellation token fires: the pending read future is dropped
//! rather than polled against a flag, and the source is released when the pump
//! returns.

use std::io;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::Unmarshal;

use crate::telemetry::{METRIC_FEEDBACK_READS, METRIC_PACKETS_FORWARDED, METRIC_PACKETS_SKIPPED};

/// Datagram buffer for producer packets. The producer streams to loopback with
/// MTU-sized packets; a datagram that fills the whole buffer may have been
/// truncated by the kernel and is dropped.
pub const RTP_BUFFER_SIZE: usize = 2048;
pub const RTCP_BUFFER_SIZE: usize = 1500;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("{0}")]
    Other(String),
}

/// Where produced RTP datagrams are read from.
#[async_trait]
pub trait PacketSource: Send {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Where parsed RTP packets go.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, packet: &Packet) -> Result<(), RelayError>;
}

/// Result of one feedback read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Packets(usize),
    EndOfStream,
}

/// Inbound control feedback (RTCP) for the outbound sender.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<Feedback, RelayError>;
}

/// Local UDP endpoint the producer streams into.
pub struct UdpPacketSource {
    socket: UdpSocket,
}

impl UdpPacketSource {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl PacketSource for UdpPacketSource {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, from) = self.socket.recv_from(buf).await?;
        trace!(%from, len, "received rtp datagram");
        Ok(len)
    }
}

#[async_trait]
impl PacketSink for TrackLocalStaticRTP {
    async fn send_packet(&self, packet: &Packet) -> Result<(), RelayError> {
        self.write_rtp(packet).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedbackSource for RTCRtpSender {
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<Feedback, RelayError> {
        match self.read(buf).await {
            Ok((packets, _attributes)) => Ok(Feedback::Packets(packets.len())),
            Err(webrtc::Error::ErrClosedPipe) | Err(webrtc::Error::ErrConnectionClosed) => {
                Ok(Feedback::EndOfStream)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub skipped: u64,
}

/// Pumps producer datagrams into the outbound track until cancelled or broken.
///
/// Corrupt or possibly truncated datagrams are skipped; a failed read or a
/// failed track write ends the pump.
pub async fn forward_packets(
    mut source: Box<dyn PacketSource>,
    sink: std::sync::Arc<dyn PacketSink>,
    cancel: CancellationToken,
) -> ForwardStats {
    let mut stats = ForwardStats::default();
    let mut buf = vec![0u8; RTP_BUFFER_SIZE];

    loop {
        let len = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("forward pump cancelled");
                break;
            }
            read = source.recv(&mut buf) => match read {
                Ok(len) => len,
                Err(err) => {
                    warn!(error = %err, "packet source read failed; stopping forward pump");
                    break;
                }
            },
        };

        if len == buf.len() {
            stats.skipped += 1;
            counter!(METRIC_PACKETS_SKIPPED, 1);
            warn!(len, "dropping datagram that filled the receive buffer");
            continue;
        }

        let packet = match Packet::unmarshal(&mut &buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                stats.skipped += 1;
                counter!(METRIC_PACKETS_SKIPPED, 1);
                warn!(error = %err, len, "skipping malformed rtp packet");
                continue;
            }
        };

        if let Err(err) = sink.send_packet(&packet).await {
            warn!(error = %err, "outbound track write failed; stopping forward pump");
            break;
        }
        stats.forwarded += 1;
        counter!(METRIC_PACKETS_FORWARDED, 1);
        trace!(
            seq = packet.header.sequence_number,
            timestamp = packet.header.timestamp,
            payload_len = packet.payload.len(),
            "forwarded rtp packet"
        );
    }

    drop(source);
    debug!(
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        "forward pump finished"
    );
    stats
}

/// Reads and discards sender feedback until cancelled or the stream ends.
/// Returns the number of successful reads.
pub async fn drain_feedback(
    source: std::sync::Arc<dyn FeedbackSource>,
    cancel: CancellationToken,
) -> u64 {
    let mut reads = 0u64;
    let mut buf = vec![0u8; RTCP_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("feedback pump cancelled");
                break;
            }
            read = source.read_feedback(&mut buf) => match read {
                Ok(Feedback::Packets(count)) => {
                    reads += 1;
                    counter!(METRIC_FEEDBACK_READS, 1);
                    trace!(count, "read rtcp feedback");
                }
                Ok(Feedback::EndOfStream) => {
                    debug!("feedback stream ended");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "feedback read failed; stopping feedback pump");
                    break;
                }
            },
        }
    }

    reads
}
