//! WebRTC engine seam.
//!
//! A session talks to its peer connection only through [`SignalingEngine`];
//! engine callbacks are turned into [`EngineEvent`]s delivered to the owning
//! session, except for terminal connection states which also raise the
//! session's cancellation token directly so the relay stops even while the
//! message loop is busy negotiating.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::relay::{FeedbackSource, PacketSink};

pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CLOCK_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u16 = 2;
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";
const TRACK_ID: &str = "audio";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("local description missing after ICE gathering")]
    MissingLocalDescription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Peer connection settings shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub relay_only: bool,
    pub udp_port_range: Option<(u16, u16)>,
    pub stream_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            relay_only: false,
            udp_port_range: None,
            stream_id: "beach-radio".to_string(),
        }
    }
}

impl EngineConfig {
    /// No ICE servers: host candidates only. Used for loopback setups and tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        let ice_transport_policy = if self.relay_only {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        };
        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }
}

/// Something the engine reported asynchronously.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalCandidate(RTCIceCandidateInit),
    GatheringComplete,
    StateChanged(RTCPeerConnectionState),
}

pub fn is_terminal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
    )
}

/// Commands the message loop issues against its peer connection.
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    /// Creates an offer, commits it locally, waits for ICE gathering to finish
    /// and returns the finalized local description.
    async fn create_offer(&self) -> Result<RTCSessionDescription, EngineError>;

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), EngineError>;

    /// Releases the peer connection. Called once, at session teardown.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Everything a session needs from a freshly built peer connection.
pub struct EngineParts {
    pub engine: Arc<dyn SignalingEngine>,
    pub sink: Arc<dyn PacketSink>,
    pub feedback: Arc<dyn FeedbackSource>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Builds one peer connection with its outbound audio track registered.
    /// Terminal connection states must cancel `cancel`.
    async fn connect(&self, cancel: CancellationToken) -> Result<EngineParts, EngineError>;
}

pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: OPUS_CHANNELS,
        sdp_fmtp_line: OPUS_FMTP.to_owned(),
        rtcp_feedback: vec![],
    }
}

pub struct WebRtcEngineFactory {
    config: EngineConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn build_api(&self) -> Result<API, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = self.config.udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max)
                .map_err(|err| EngineError::Setup(format!("udp port range {min}-{max}: {err}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn connect(&self, cancel: CancellationToken) -> Result<EngineParts, EngineError> {
        let api = self.build_api()?;
        let peer_connection = Arc::new(
            api.new_peer_connection(self.config.rtc_configuration())
                .await?,
        );

        let track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            TRACK_ID.to_owned(),
            self.config.stream_id.clone(),
        ));
        let sender = match peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(err) => {
                if let Err(close_err) = peer_connection.close().await {
                    warn!(error = %close_err, "failed to close peer connection after add_track error");
                }
                return Err(err.into());
            }
        };
        debug!("audio track added to peer connection");

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => EngineEvent::LocalCandidate(init),
                        Err(err) => {
                            warn!(error = %err, "failed to serialize local ice candidate");
                            return;
                        }
                    },
                    None => EngineEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let state_tx = events_tx;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    info!(%state, "peer connection state changed");
                    if is_terminal(state) {
                        cancel.cancel();
                    }
                    let _ = tx.send(EngineEvent::StateChanged(state));
                })
            },
        ));

        Ok(EngineParts {
            engine: Arc::new(WebRtcEngine {
                peer_connection,
                sender: Arc::clone(&sender),
            }),
            sink: track,
            feedback: sender,
            events: events_rx,
        })
    }
}

struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl SignalingEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<RTCSessionDescription, EngineError> {
        let offer = self.peer_connection.create_offer(None).await?;
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(offer).await?;
        let _ = gathering_complete.recv().await;
        self.peer_connection
            .local_description()
            .await
            .ok_or(EngineError::MissingLocalDescription)
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), EngineError> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), EngineError> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if let Err(err) = self.sender.stop().await {
            debug!(error = %err, "rtp sender stop reported an error");
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn relay_only_selects_relay_policy() {
        let config = EngineConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["turn:turn.example.net:3478".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            }],
            relay_only: true,
            ..Default::default()
        };
        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].username, "user");
        assert_eq!(rtc.ice_servers[0].credential, "secret");
    }

    #[test_timeout::timeout]
    fn default_config_uses_public_stun() {
        let rtc = EngineConfig::default().rtc_configuration();
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::All);
        assert_eq!(
            rtc.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test_timeout::timeout]
    fn terminal_states() {
        assert!(is_terminal(RTCPeerConnectionState::Failed));
        assert!(is_terminal(RTCPeerConnectionState::Closed));
        assert!(!is_terminal(RTCPeerConnectionState::Disconnected));
        assert!(!is_terminal(RTCPeerConnectionState::Connected));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn offer_advertises_opus_payload_type() {
        let factory = WebRtcEngineFactory::new(EngineConfig::localhost());
        let parts = factory.connect(CancellationToken::new()).await.unwrap();

        let offer = parts.engine.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("a=rtpmap:111 opus/48000/2"));

        parts.engine.close().await.unwrap();
    }
}
