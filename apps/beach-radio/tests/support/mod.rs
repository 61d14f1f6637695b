#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use beach_radio::engine::{
    EngineError, EngineEvent, EngineFactory, EngineParts, SignalingEngine,
};
use beach_radio::producer::{ProducerError, ProducerHandle, ProducerLauncher};
use beach_radio::protocol::SignalMessage;
use beach_radio::relay::{Feedback, FeedbackSource, PacketSink, PacketSource, RelayError};
use beach_radio::session::{ChannelError, SignalChannel};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

pub const FAKE_OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

pub fn candidate(n: u16) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn text(kind: &str, data: &str) -> String {
    serde_json::to_string(&SignalMessage::new(kind, data)).unwrap()
}

/// A marshalled Opus-shaped RTP packet carrying `seq`.
pub fn rtp_bytes(seq: u16) -> Vec<u8> {
    Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number: seq,
            timestamp: u32::from(seq) * 960,
            ssrc: 0xbeac,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x5a; 32]),
    }
    .marshal()
    .unwrap()
    .to_vec()
}

/// Shared, ordered record of teardown steps across the fakes.
pub type EventLog = Arc<Mutex<Vec<&'static str>>>;

pub const FORWARD_EXIT: &str = "forward-exit";
pub const FEEDBACK_EXIT: &str = "feedback-exit";
pub const PRODUCER_STOP: &str = "producer-stop";
pub const ENGINE_CLOSE: &str = "engine-close";

pub fn answer_text() -> String {
    let mut answer = RTCSessionDescription::default();
    answer.sdp_type = RTCSdpType::Answer;
    answer.sdp = FAKE_OFFER_SDP.into();
    text("answer", &serde_json::to_string(&answer).unwrap())
}

/// Producer that replays scripted datagrams, then goes quiet, and counts
/// lifecycle calls.
#[derive(Default)]
pub struct FakeLauncher {
    pub starts: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub fail: bool,
    pub packets: Vec<Vec<u8>>,
    pub log: EventLog,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_packets(mut self, packets: Vec<Vec<u8>>) -> Self {
        self.packets = packets;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct FakeProducer {
    stops: Arc<AtomicUsize>,
    log: EventLog,
}

#[async_trait]
impl ProducerHandle for FakeProducer {
    async fn stop(self: Box<Self>) {
        self.log.lock().push(PRODUCER_STOP);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedSource {
    datagrams: VecDeque<Vec<u8>>,
    log: EventLog,
}

#[async_trait]
impl PacketSource for ScriptedSource {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.datagrams.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            None => std::future::pending().await,
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.log.lock().push(FORWARD_EXIT);
    }
}

#[async_trait]
impl ProducerLauncher for FakeLauncher {
    async fn start(
        &self,
    ) -> Result<(Box<dyn ProducerHandle>, Box<dyn PacketSource>), ProducerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProducerError::Spawn {
                program: "fake-producer",
                source: io::Error::new(io::ErrorKind::NotFound, "not installed"),
            });
        }
        Ok((
            Box::new(FakeProducer {
                stops: Arc::clone(&self.stops),
                log: Arc::clone(&self.log),
            }),
            Box::new(ScriptedSource {
                datagrams: self.packets.iter().cloned().collect(),
                log: Arc::clone(&self.log),
            }),
        ))
    }
}

/// What a fake engine was asked to do.
#[derive(Default)]
pub struct EngineRecord {
    pub offers: AtomicUsize,
    pub remotes: Mutex<Vec<RTCSessionDescription>>,
    pub candidates: Mutex<Vec<RTCIceCandidateInit>>,
    pub closes: AtomicUsize,
    /// Sequence numbers written to the outbound track, in order.
    pub forwarded: Mutex<Vec<u16>>,
}

impl EngineRecord {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn forwarded(&self) -> Vec<u16> {
        self.forwarded.lock().clone()
    }
}

struct FakeEngine {
    record: Arc<EngineRecord>,
    log: EventLog,
}

#[async_trait]
impl SignalingEngine for FakeEngine {
    async fn create_offer(&self) -> Result<RTCSessionDescription, EngineError> {
        self.record.offers.fetch_add(1, Ordering::SeqCst);
        let mut offer = RTCSessionDescription::default();
        offer.sdp_type = RTCSdpType::Offer;
        offer.sdp = FAKE_OFFER_SDP.into();
        Ok(offer)
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), EngineError> {
        self.record.remotes.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), EngineError> {
        self.record.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.log.lock().push(ENGINE_CLOSE);
        self.record.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingSink {
    record: Arc<EngineRecord>,
}

#[async_trait]
impl PacketSink for RecordingSink {
    async fn send_packet(&self, packet: &Packet) -> Result<(), RelayError> {
        self.record
            .forwarded
            .lock()
            .push(packet.header.sequence_number);
        Ok(())
    }
}

struct QuietFeedback {
    log: EventLog,
}

#[async_trait]
impl FeedbackSource for QuietFeedback {
    async fn read_feedback(&self, _buf: &mut [u8]) -> Result<Feedback, RelayError> {
        std::future::pending().await
    }
}

impl Drop for QuietFeedback {
    fn drop(&mut self) {
        self.log.lock().push(FEEDBACK_EXIT);
    }
}

/// Test-side controls for one connected fake engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub cancel: CancellationToken,
    pub record: Arc<EngineRecord>,
}

impl EngineHandle {
    pub fn discover(&self, candidate: RTCIceCandidateInit) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    pub fn set_state(&self, state: RTCPeerConnectionState) {
        let _ = self.events.send(EngineEvent::StateChanged(state));
    }

    /// Reports a failed connection the way the real engine's callback does.
    pub fn fail(&self) {
        self.cancel.cancel();
        self.set_state(RTCPeerConnectionState::Failed);
    }
}

#[derive(Default)]
pub struct FakeEngineFactory {
    pub fail: bool,
    pub handles: Mutex<Vec<EngineHandle>>,
    pub log: EventLog,
}

impl FakeEngineFactory {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn connects(&self) -> usize {
        self.handles.lock().len()
    }

    pub async fn wait_for_handle(&self, index: usize) -> EngineHandle {
        loop {
            if let Some(handle) = self.handles.lock().get(index).cloned() {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn connect(&self, cancel: CancellationToken) -> Result<EngineParts, EngineError> {
        if self.fail {
            return Err(EngineError::Setup("no media engine".into()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let record = Arc::new(EngineRecord::default());
        self.handles.lock().push(EngineHandle {
            events: events_tx,
            cancel,
            record: Arc::clone(&record),
        });
        Ok(EngineParts {
            engine: Arc::new(FakeEngine {
                record: Arc::clone(&record),
                log: Arc::clone(&self.log),
            }),
            sink: Arc::new(RecordingSink { record }),
            feedback: Arc::new(QuietFeedback {
                log: Arc::clone(&self.log),
            }),
            events: events_rx,
        })
    }
}

/// Signaling channel fed from the test body.
pub struct ScriptedChannel {
    rx: mpsc::UnboundedReceiver<Result<String, ChannelError>>,
}

pub fn scripted_channel() -> (
    mpsc::UnboundedSender<Result<String, ChannelError>>,
    ScriptedChannel,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ScriptedChannel { rx })
}

#[async_trait]
impl SignalChannel for ScriptedChannel {
    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        self.rx.recv().await
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
