//! WHEP negotiation session
//!
//! One session negotiates one receive-only media session with one edge:
//!
//! ```text
//! Idle ──open──► Offering ──OfferReady──► AwaitingAnswer ──2xx──► Connected
//!                   │                          │                     │
//!                   └──────── Failed ◄─────────┴──── ICE lost ───────┘
//!
//! any state ──close──► Closed
//! ```
//!
//! The offer is POSTed once as `application/sdp`; the answer comes back in the
//! response body and the `Location` header names the server-side session,
//! which is released with a single DELETE on [`NegotiationSession::close`].

use crate::endpoint::{
    Connectivity, EndpointEvent, EndpointFactory, EventSink, MediaEndpoint, MediaTrack,
};
use crate::stream::{whep_url, StreamName};
use crate::{Error, Result};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SDP media type used for the offer/answer exchange
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Negotiation progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Created, not opened
    Idle,
    /// Local offer being produced
    Offering,
    /// Offer sent, waiting for the edge's answer
    AwaitingAnswer,
    /// Answer applied, media path expected
    Connected,
    /// Negotiation or connectivity failed
    Failed,
    /// Torn down
    Closed,
}

impl NegotiationState {
    /// Whether the session can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting_answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Server-issued locator of a negotiated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Absolute URL of the session resource
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Progress reported by [`NegotiationSession::next`]
#[derive(Debug)]
pub enum SessionEvent {
    /// The answer was applied
    Connected,
    /// The first remote track was attached as the session's media
    MediaAttached(MediaTrack),
    /// Connectivity was lost after connecting; the session has failed
    Disconnected(Connectivity),
    /// Negotiation failed
    Failed(Error),
}

/// Successful WHEP response
#[derive(Debug)]
struct WhepAnswer {
    sdp: String,
    location: Option<String>,
}

/// Finished offer/answer exchange, answer already applied locally
#[derive(Debug)]
enum Exchange {
    /// The POST failed or was rejected
    Rejected(Error),
    /// The edge answered; `applied` is the local endpoint's verdict
    Answered {
        location: Option<String>,
        applied: Result<()>,
    },
}

/// One WHEP offer/answer exchange and the media session it creates
pub struct NegotiationSession {
    id: String,
    stream: StreamName,
    host: String,
    url: String,
    state: NegotiationState,

    http: reqwest::Client,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    handle: Option<SessionHandle>,
    media: Option<MediaTrack>,
    failure: Option<String>,

    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    exchange: Option<JoinHandle<()>>,
    exchanges_tx: mpsc::UnboundedSender<Exchange>,
    exchanges_rx: mpsc::UnboundedReceiver<Exchange>,
}

impl NegotiationSession {
    /// Create an idle session targeting `{scheme}://{host}/view/webrtc/{stream}`
    pub fn new(http: reqwest::Client, scheme: &str, host: &str, stream: StreamName) -> Self {
        let (events_tx, events_rx) = EventSink::channel();
        let (exchanges_tx, exchanges_rx) = mpsc::unbounded_channel();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: whep_url(scheme, host, &stream),
            stream,
            host: host.to_string(),
            state: NegotiationState::Idle,
            http,
            endpoint: None,
            handle: None,
            media: None,
            failure: None,
            events_tx,
            events_rx,
            exchange: None,
            exchanges_tx,
            exchanges_rx,
        }
    }

    /// Session ID used in logs
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Edge host this session negotiates with
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Stream being played
    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    /// WHEP endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Server-side session locator, once known
    pub fn session_handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    /// Attached remote media
    pub fn media(&self) -> Option<&MediaTrack> {
        self.media.as_ref()
    }

    /// Description of the failure that ended the session
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Create the local endpoint and start the offer
    pub async fn open(&mut self, factory: &dyn EndpointFactory) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(Error::SessionClosed(format!(
                "session {} cannot be opened in state {}",
                self.id, self.state
            )));
        }

        info!(
            session_id = %self.id,
            stream = %self.stream,
            url = %self.url,
            "Opening WHEP session"
        );

        let endpoint = match factory.create(self.events_tx.clone()).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        self.endpoint = Some(Arc::clone(&endpoint));
        self.set_state(NegotiationState::Offering);

        if let Err(e) = endpoint.start_offer().await {
            self.record_failure(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the next observable change
    ///
    /// Never completes once the session is closed. Cancel safe: the exchange
    /// task only reports once the answer has been applied, so dropping this
    /// future never loses progress.
    pub async fn next(&mut self) -> SessionEvent {
        loop {
            if self.state == NegotiationState::Closed {
                futures::future::pending::<()>().await;
            }

            let handled = tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_endpoint_event(event),
                Some(exchange) = self.exchanges_rx.recv() => self.on_exchange(exchange),
                else => futures::future::pending().await,
            };

            if let Some(event) = handled {
                return event;
            }
        }
    }

    /// Release the remote session and the local endpoint
    ///
    /// The DELETE is best-effort and sent at most once. Closing a closed
    /// session does nothing.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }

        if let Some(exchange) = self.exchange.take() {
            exchange.abort();
        }

        match self.handle.take() {
            Some(handle) => self.delete_remote(&handle).await,
            None if self.state == NegotiationState::Connected => {
                debug!(session_id = %self.id, "No session locator, skipping remote teardown");
            }
            None => {}
        }

        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.close().await {
                warn!(session_id = %self.id, error = %e, "Failed to close local endpoint");
            }
        }

        self.set_state(NegotiationState::Closed);
        info!(session_id = %self.id, "WHEP session closed");
    }

    fn on_endpoint_event(&mut self, event: EndpointEvent) -> Option<SessionEvent> {
        match event {
            EndpointEvent::OfferReady(sdp) if self.state == NegotiationState::Offering => {
                self.send_offer(sdp);
                None
            }
            EndpointEvent::OfferFailed(reason) if self.state == NegotiationState::Offering => {
                Some(self.fail(Error::Sdp(reason)))
            }
            EndpointEvent::OfferReady(_) | EndpointEvent::OfferFailed(_) => {
                debug!(session_id = %self.id, state = %self.state, "Ignoring late offer event");
                None
            }
            EndpointEvent::TrackArrived(track) => {
                if self.state.is_terminal() {
                    return None;
                }
                if self.media.is_some() {
                    debug!(
                        session_id = %self.id,
                        kind = %track.kind(),
                        id = track.id(),
                        "Ignoring additional track"
                    );
                    return None;
                }
                info!(
                    session_id = %self.id,
                    kind = %track.kind(),
                    stream_id = track.stream_id(),
                    "Remote media attached"
                );
                self.media = Some(track.clone());
                Some(SessionEvent::MediaAttached(track))
            }
            EndpointEvent::ConnectivityChanged(connectivity) => {
                if self.state == NegotiationState::Connected && connectivity.is_lost() {
                    warn!(
                        session_id = %self.id,
                        connectivity = %connectivity,
                        "Media connectivity lost"
                    );
                    self.fail(Error::MediaConnectivityLost(format!(
                        "ICE connection {}",
                        connectivity
                    )));
                    return Some(SessionEvent::Disconnected(connectivity));
                }
                debug!(session_id = %self.id, connectivity = %connectivity, "Connectivity changed");
                None
            }
        }
    }

    fn on_exchange(&mut self, exchange: Exchange) -> Option<SessionEvent> {
        self.exchange = None;
        if self.state != NegotiationState::AwaitingAnswer {
            return None;
        }

        let (location, applied) = match exchange {
            Exchange::Rejected(e) => return Some(self.fail(e)),
            Exchange::Answered { location, applied } => (location, applied),
        };

        // Kept even if the answer was unusable, so close still releases it
        match location {
            Some(location) => {
                debug!(session_id = %self.id, location = %location, "Session locator received");
                self.handle = Some(SessionHandle(location));
            }
            None => warn!(
                session_id = %self.id,
                "WHEP response has no Location header; remote session cannot be released"
            ),
        }

        if let Err(e) = applied {
            return Some(self.fail(e));
        }

        self.set_state(NegotiationState::Connected);
        info!(session_id = %self.id, host = %self.host, "WHEP session connected");
        Some(SessionEvent::Connected)
    }

    fn send_offer(&mut self, sdp: String) {
        self.set_state(NegotiationState::AwaitingAnswer);

        let http = self.http.clone();
        let url = self.url.clone();
        let endpoint = self.endpoint.clone();
        let exchanges = self.exchanges_tx.clone();
        debug!(session_id = %self.id, url = %url, bytes = sdp.len(), "Sending offer");

        self.exchange = Some(tokio::spawn(async move {
            let exchange = match post_offer(&http, &url, sdp).await {
                Err(e) => Exchange::Rejected(e),
                Ok(answer) => {
                    let applied = match endpoint {
                        Some(endpoint) => endpoint.apply_answer(answer.sdp).await,
                        None => Err(Error::SessionClosed("local endpoint released".to_string())),
                    };
                    Exchange::Answered {
                        location: answer.location,
                        applied,
                    }
                }
            };
            let _ = exchanges.send(exchange);
        }));
    }

    async fn delete_remote(&self, handle: &SessionHandle) {
        debug!(session_id = %self.id, location = handle.as_str(), "Releasing remote session");

        match self.http.delete(handle.as_str()).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                session_id = %self.id,
                status = response.status().as_u16(),
                "Remote session release rejected"
            ),
            Err(e) => warn!(session_id = %self.id, error = %e, "Remote session release failed"),
        }
    }

    fn fail(&mut self, error: Error) -> SessionEvent {
        self.record_failure(&error);
        SessionEvent::Failed(error)
    }

    fn record_failure(&mut self, error: &Error) {
        warn!(session_id = %self.id, state = %self.state, error = %error, "WHEP session failed");
        self.failure = Some(error.to_string());
        self.set_state(NegotiationState::Failed);
    }

    fn set_state(&mut self, state: NegotiationState) {
        if self.state != state {
            debug!(
                session_id = %self.id,
                from = %self.state,
                to = %state,
                "Negotiation state transition"
            );
            self.state = state;
        }
    }
}

impl Drop for NegotiationSession {
    fn drop(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            exchange.abort();
        }
        if let Some(endpoint) = self.endpoint.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = endpoint.close().await;
                });
            }
        }
    }
}

/// POST the offer and read the answer
async fn post_offer(http: &reqwest::Client, url: &str, sdp: String) -> Result<WhepAnswer> {
    let response = http
        .post(url)
        .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
        .body(sdp)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::NegotiationRejected {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        });
    }

    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(|location| resolve_location(url, location));

    let sdp = response.text().await?;
    if sdp.trim().is_empty() {
        return Err(Error::Sdp("WHEP response has an empty answer".to_string()));
    }

    Ok(WhepAnswer { sdp, location })
}

/// Resolve a possibly relative `Location` against the WHEP endpoint
fn resolve_location(endpoint: &str, location: &str) -> String {
    url::Url::parse(endpoint)
        .and_then(|base| base.join(location))
        .map(String::from)
        .unwrap_or_else(|_| location.to_string())
}
