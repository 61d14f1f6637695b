//! Per-connection signaling session.
//!
//! A [`Session`] owns everything for one client: the producer process, the
//! peer connection, the candidate buffer and both relay pumps. It drives the
//! offer/answer/ICE exchange from a single message loop and tears everything
//! down through one path, in a fixed order, however the loop ends.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::candidates::CandidateBuffer;
use crate::engine::{is_terminal, EngineError, EngineEvent, EngineFactory, SignalingEngine};
use crate::producer::{ProducerError, ProducerLauncher};
use crate::protocol::{ClientCommand, SignalMessage, TYPE_ANSWER, TYPE_CANDIDATE, TYPE_OFFER};
use crate::relay::{drain_feedback, forward_packets, ForwardStats};
use crate::telemetry::{METRIC_SESSIONS_ENDED, METRIC_SESSIONS_STARTED};

#[derive(Debug, Error)]
#[error("signaling channel failed: {0}")]
pub struct ChannelError(pub String);

/// Inbound half of the signaling transport.
#[async_trait]
pub trait SignalChannel: Send {
    /// Next text message; `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    IceExchange,
    Connected,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("producer: {0}")]
    Producer(#[from] ProducerError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("outbound message queue closed")]
    OutboxClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the channel.
    ChannelClosed,
    /// The session was cancelled: engine failure, engine close or shutdown.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub forwarded: ForwardStats,
    pub feedback_reads: u64,
}

pub struct Session {
    id: Uuid,
    launcher: Arc<dyn ProducerLauncher>,
    engines: Arc<dyn EngineFactory>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// `cancel` is this session's own token; pass a child token to tie the
    /// session to a wider shutdown.
    pub fn new(
        launcher: Arc<dyn ProducerLauncher>,
        engines: Arc<dyn EngineFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::New);
        Self {
            id: Uuid::new_v4(),
            launcher,
            engines,
            cancel,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs the session to completion. Outbound messages are queued on
    /// `outbox`; a separate writer drains it onto the wire.
    pub async fn run<C>(
        self,
        channel: C,
        outbox: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<SessionReport, SessionError>
    where
        C: SignalChannel,
    {
        let span = info_span!("session", id = %self.id);
        self.run_inner(channel, outbox).instrument(span).await
    }

    async fn run_inner<C>(
        self,
        mut channel: C,
        outbox: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<SessionReport, SessionError>
    where
        C: SignalChannel,
    {
        counter!(METRIC_SESSIONS_STARTED, 1);
        info!("session started");
        let Session {
            launcher,
            engines,
            cancel,
            state,
            ..
        } = self;

        let (producer, source) = match launcher.start().await {
            Ok(started) => started,
            Err(err) => {
                warn!(error = %err, "producer launch failed");
                return Err(finish(&state, err.into()));
            }
        };

        let parts = match engines.connect(cancel.clone()).await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "peer connection setup failed");
                producer.stop().await;
                return Err(finish(&state, err.into()));
            }
        };
        let mut events = parts.events;
        let engine = parts.engine;

        let forward = tokio::spawn(
            forward_packets(source, parts.sink, cancel.child_token()).in_current_span(),
        );
        let feedback =
            tokio::spawn(drain_feedback(parts.feedback, cancel.child_token()).in_current_span());

        let mut negotiator = Negotiator::new(Arc::clone(&engine), outbox, &state, cancel.clone());
        let outcome: Result<SessionEnd, SessionError> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),
                Some(event) = events.recv() => {
                    if let Err(err) = negotiator.on_event(event) {
                        break Err(err);
                    }
                }
                incoming = channel.recv() => match incoming {
                    None => {
                        debug!("signaling channel closed by peer");
                        break Ok(SessionEnd::ChannelClosed);
                    }
                    Some(Err(err)) => break Err(err.into()),
                    Some(Ok(text)) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),
                            handled = negotiator.handle_text(&text) => {
                                if let Err(err) = handled {
                                    break Err(err);
                                }
                            }
                        }
                    }
                },
            }
        };
        drop(negotiator);

        cancel.cancel();
        let forwarded = forward.await.unwrap_or_else(|err| {
            warn!(error = %err, "forward pump task failed");
            ForwardStats::default()
        });
        let feedback_reads = feedback.await.unwrap_or_else(|err| {
            warn!(error = %err, "feedback pump task failed");
            0
        });
        producer.stop().await;
        if let Err(err) = engine.close().await {
            warn!(error = %err, "failed to close peer connection");
        }

        match outcome {
            Ok(end) => {
                state.send_replace(SessionState::Closed);
                counter!(METRIC_SESSIONS_ENDED, 1);
                info!(
                    ?end,
                    forwarded = forwarded.forwarded,
                    skipped = forwarded.skipped,
                    feedback_reads,
                    "session finished"
                );
                Ok(SessionReport {
                    end,
                    forwarded,
                    feedback_reads,
                })
            }
            Err(err) => {
                warn!(error = %err, forwarded = forwarded.forwarded, "session failed");
                Err(finish(&state, err))
            }
        }
    }
}

fn finish(state: &watch::Sender<SessionState>, err: SessionError) -> SessionError {
    state.send_replace(SessionState::Closed);
    counter!(METRIC_SESSIONS_ENDED, 1);
    err
}

/// Message handlers. Only this type issues commands to the engine.
struct Negotiator<'a> {
    engine: Arc<dyn SignalingEngine>,
    outbox: mpsc::UnboundedSender<SignalMessage>,
    state: &'a watch::Sender<SessionState>,
    candidates: CandidateBuffer<RTCIceCandidateInit>,
    cancel: CancellationToken,
}

impl<'a> Negotiator<'a> {
    fn new(
        engine: Arc<dyn SignalingEngine>,
        outbox: mpsc::UnboundedSender<SignalMessage>,
        state: &'a watch::Sender<SessionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            outbox,
            state,
            candidates: CandidateBuffer::new(),
            cancel,
        }
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "session state changed");
        }
    }

    fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        self.outbox
            .send(message)
            .map_err(|_| SessionError::OutboxClosed)
    }

    fn send_candidate(&self, candidate: &RTCIceCandidateInit) -> Result<(), SessionError> {
        let json = serde_json::to_string(candidate).map_err(|source| SessionError::Encode {
            kind: TYPE_CANDIDATE,
            source,
        })?;
        self.send(SignalMessage::candidate(json))
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), SessionError> {
        let message = match SignalMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed signaling message");
                return Ok(());
            }
        };

        match message.command() {
            ClientCommand::Initiation => self.on_initiation().await,
            ClientCommand::Answer(data) => self.on_answer(data).await,
            ClientCommand::Candidate(data) => self.on_remote_candidate(data).await,
            ClientCommand::ReqIce => self.on_reqice(),
            ClientCommand::Unknown(kind) => {
                warn!(kind, "ignoring unknown message type");
                Ok(())
            }
        }
    }

    async fn on_initiation(&mut self) -> Result<(), SessionError> {
        if self.current() != SessionState::New {
            warn!(state = ?self.current(), "ignoring repeated Initiation");
            return Ok(());
        }
        self.set_state(SessionState::Negotiating);

        let offer = self.engine.create_offer().await?;
        let json = serde_json::to_string(&offer).map_err(|source| SessionError::Encode {
            kind: TYPE_OFFER,
            source,
        })?;
        self.send(SignalMessage::offer(json))?;
        info!("offer sent");
        Ok(())
    }

    async fn on_answer(&mut self, data: &str) -> Result<(), SessionError> {
        if self.current() != SessionState::Negotiating {
            warn!(state = ?self.current(), "ignoring answer outside negotiation");
            return Ok(());
        }
        let answer: RTCSessionDescription =
            serde_json::from_str(data).map_err(|source| SessionError::Decode {
                kind: TYPE_ANSWER,
                source,
            })?;
        self.engine.set_remote_description(answer).await?;
        self.send(SignalMessage::reqice())?;
        self.set_state(SessionState::IceExchange);
        info!("answer applied");
        Ok(())
    }

    async fn on_remote_candidate(&mut self, data: &str) -> Result<(), SessionError> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_str(data).map_err(|source| SessionError::Decode {
                kind: TYPE_CANDIDATE,
                source,
            })?;
        debug!(candidate = %candidate.candidate, "adding remote candidate");
        self.engine.add_ice_candidate(candidate).await?;
        Ok(())
    }

    fn on_reqice(&mut self) -> Result<(), SessionError> {
        let released = self.candidates.mark_ready();
        debug!(count = released.len(), "client ready for candidates");
        for candidate in &released {
            self.send_candidate(candidate)?;
        }
        Ok(())
    }

    fn on_event(&mut self, event: EngineEvent) -> Result<(), SessionError> {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = self.candidates.record(candidate) {
                    self.send_candidate(&candidate)?;
                }
            }
            EngineEvent::GatheringComplete => debug!("local ICE gathering complete"),
            EngineEvent::StateChanged(RTCPeerConnectionState::Connected) => {
                self.set_state(SessionState::Connected);
            }
            EngineEvent::StateChanged(state) if is_terminal(state) => {
                info!(%state, "peer connection ended");
                self.cancel.cancel();
            }
            EngineEvent::StateChanged(_) => {}
        }
        Ok(())
    }
}
