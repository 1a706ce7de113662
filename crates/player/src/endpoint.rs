//! Local media endpoint: the receive-only WebRTC peer connection
//!
//! The peer connection reports progress through callbacks. They are converted
//! at this seam into a closed set of [`EndpointEvent`]s, delivered in order
//! through an [`EventSink`] to the owning
//! [`NegotiationSession`](crate::negotiation::NegotiationSession).

use crate::config::PlayerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// Kind of a received media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Handle on a remote media track, ready to attach to a sink
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
    remote: Option<Arc<TrackRemote>>,
}

impl MediaTrack {
    /// Describe a track without an underlying RTP source
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            remote: None,
        }
    }

    /// Wrap a track received on a peer connection
    pub fn from_remote(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };

        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            remote: Some(track),
        }
    }

    /// Track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// ID of the media stream the track belongs to
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Audio or video
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Underlying remote track for reading RTP, if any
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

/// ICE connectivity as seen by the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Gathering or waiting for remote candidates
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable path was found
    Connected,
    /// All checks finished with a usable path
    Completed,
    /// Path lost, may recover
    Disconnected,
    /// No usable path
    Failed,
    /// Endpoint shut down
    Closed,
}

impl Connectivity {
    /// Whether this state means the media path is gone
    pub fn is_lost(&self) -> bool {
        matches!(self, Connectivity::Disconnected | Connectivity::Failed)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Connectivity::New => "new",
            Connectivity::Checking => "checking",
            Connectivity::Connected => "connected",
            Connectivity::Completed => "completed",
            Connectivity::Disconnected => "disconnected",
            Connectivity::Failed => "failed",
            Connectivity::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCIceConnectionState> for Connectivity {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => Connectivity::Checking,
            RTCIceConnectionState::Connected => Connectivity::Connected,
            RTCIceConnectionState::Completed => Connectivity::Completed,
            RTCIceConnectionState::Disconnected => Connectivity::Disconnected,
            RTCIceConnectionState::Failed => Connectivity::Failed,
            RTCIceConnectionState::Closed => Connectivity::Closed,
            _ => Connectivity::New,
        }
    }
}

/// Notification from the local endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// The local offer is complete (candidates included)
    OfferReady(String),
    /// The local offer could not be produced
    OfferFailed(String),
    /// A remote track arrived
    TrackArrived(MediaTrack),
    /// ICE connectivity changed
    ConnectivityChanged(Connectivity),
}

/// Sending half of an endpoint's event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EndpointEvent>,
}

impl EventSink {
    /// Create a sink and the receiver it feeds
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event
    ///
    /// Returns `false` once the receiving session is gone.
    pub fn emit(&self, event: EndpointEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Local side of a media session
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Begin producing the local offer
    ///
    /// Completion is reported as [`EndpointEvent::OfferReady`] or
    /// [`EndpointEvent::OfferFailed`].
    async fn start_offer(&self) -> Result<()>;

    /// Apply the remote answer
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Release the endpoint
    async fn close(&self) -> Result<()>;
}

/// Creates local endpoints for new sessions
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    /// Create an endpoint that reports to `events`
    async fn create(&self, events: EventSink) -> Result<Arc<dyn MediaEndpoint>>;
}

/// Factory for receive-only WebRTC peer connections
#[derive(Debug, Clone)]
pub struct RtcEndpointFactory {
    ice_servers: Vec<String>,
    gathering_timeout: Duration,
}

impl RtcEndpointFactory {
    /// Create a factory from configuration
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            ice_servers: config.stun_servers.clone(),
            gathering_timeout: config.ice_gathering_timeout(),
        }
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn MediaEndpoint>> {
        let endpoint = RtcEndpoint::new(&self.ice_servers, self.gathering_timeout, events).await?;
        Ok(Arc::new(endpoint))
    }
}

/// Receive-only peer connection with one video and one audio transceiver
pub struct RtcEndpoint {
    peer_connection: Arc<RTCPeerConnection>,
    events: EventSink,
    gathering_timeout: Duration,
    offer_task: Mutex<Option<JoinHandle<()>>>,
}

impl RtcEndpoint {
    /// Create the peer connection and register its handlers
    #[instrument(skip(events))]
    pub async fn new(
        ice_servers: &[String],
        gathering_timeout: Duration,
        events: EventSink,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtc(format!("Failed to create peer connection: {}", e))
        })?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to add {} transceiver: {}", kind, e)))?;
        }

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let track = MediaTrack::from_remote(track);
                    debug!(kind = %track.kind(), id = track.id(), "Remote track added");
                    events.emit(EndpointEvent::TrackArrived(track));
                })
            },
        ));

        let ice_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = ice_events.clone();
                Box::pin(async move {
                    debug!(state = %state, "ICE connection state changed");
                    events.emit(EndpointEvent::ConnectivityChanged(state.into()));
                })
            },
        ));

        info!(ice_servers = ice_servers.len(), "Receive-only peer connection created");

        Ok(Self {
            peer_connection,
            events,
            gathering_timeout,
            offer_task: Mutex::new(None),
        })
    }

    /// Create the offer and wait (bounded) for candidate gathering
    async fn produce_offer(
        peer_connection: &RTCPeerConnection,
        gathering_timeout: Duration,
    ) -> Result<String> {
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;

        // WHEP carries no trickle channel, so candidates must be in the offer
        let mut gathering_complete = peer_connection.gathering_complete_promise().await;

        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(gathering_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = gathering_timeout.as_millis() as u64,
                "ICE gathering incomplete, sending offer with candidates found so far"
            );
        }

        let local = peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting offer".to_string()))?;

        Ok(local.sdp)
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn start_offer(&self) -> Result<()> {
        let peer_connection = Arc::clone(&self.peer_connection);
        let events = self.events.clone();
        let gathering_timeout = self.gathering_timeout;

        let task = tokio::spawn(async move {
            let event = match Self::produce_offer(&peer_connection, gathering_timeout).await {
                Ok(sdp) => EndpointEvent::OfferReady(sdp),
                Err(e) => EndpointEvent::OfferFailed(e.to_string()),
            };
            events.emit(event);
        });

        if let Some(previous) = self.offer_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::Sdp(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.offer_task.lock().take() {
            task.abort();
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}
