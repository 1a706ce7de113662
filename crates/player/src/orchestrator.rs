//! Playback orchestrator
//!
//! Composes a [`ResolutionController`] and at most one [`NegotiationSession`]
//! on a single background task. Collaborators drive it through
//! [`PlaybackOrchestrator`] and observe it through a `watch` channel of
//! [`PlaybackSnapshot`]s.

use crate::config::PlayerConfig;
use crate::directory::{Directory, DirectoryClient, ResolutionStatus};
use crate::endpoint::{EndpointFactory, MediaTrack, RtcEndpointFactory};
use crate::negotiation::{NegotiationSession, SessionEvent};
use crate::resolution::{ResolutionController, ResolutionUpdate};
use crate::stream::{PlayerUris, StreamName};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborator-facing playback status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackStatus {
    /// Looking for the stream or an edge
    Resolving,
    /// No source is published, or no edge has capacity
    NoSource,
    /// The directory could not be queried
    Error,
    /// An edge was found and the media session is being negotiated
    Connecting,
    /// Media session established (or, embedded, edge URIs available)
    Connected,
    /// The media session failed; a new resolution cycle follows
    Failed,
}

impl PlaybackStatus {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Resolving => "resolving",
            PlaybackStatus::NoSource => "no-source",
            PlaybackStatus::Error => "error",
            PlaybackStatus::Connecting => "connecting",
            PlaybackStatus::Connected => "connected",
            PlaybackStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ResolutionStatus> for PlaybackStatus {
    fn from(status: ResolutionStatus) -> Self {
        match status {
            ResolutionStatus::Loading => PlaybackStatus::Resolving,
            ResolutionStatus::NoStream => PlaybackStatus::NoSource,
            ResolutionStatus::Error => PlaybackStatus::Error,
            ResolutionStatus::Ready => PlaybackStatus::Connecting,
        }
    }
}

/// Where the orchestrator is in the resolution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    /// Checking whether a source exists
    Resolving,
    /// No source could be confirmed
    NoSource,
    /// A source exists; asking for an edge
    NodeSearching,
    /// An edge host is known
    Ready,
}

/// How media is consumed once an edge is known
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerMode {
    /// Negotiate a WHEP session and hand out the received track
    #[default]
    Whep,
    /// Only resolve the edge; an external player uses the derived URIs
    Embedded,
}

impl fmt::Display for PlayerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerMode::Whep => f.write_str("whep"),
            PlayerMode::Embedded => f.write_str("embedded"),
        }
    }
}

impl FromStr for PlayerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whep" | "webrtc" => Ok(PlayerMode::Whep),
            "embedded" | "embed" => Ok(PlayerMode::Embedded),
            other => Err(Error::InvalidConfig(format!(
                "unknown player mode '{}' (expected whep or embedded)",
                other
            ))),
        }
    }
}

/// Observable playback state
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    /// Stream being played, if any
    pub stream: Option<StreamName>,
    /// Resolution phase
    pub phase: PlaybackPhase,
    /// Collaborator-facing status
    pub status: PlaybackStatus,
    /// Resolved edge host
    pub host: Option<String>,
    /// URIs derived from the resolved host
    pub uris: Option<PlayerUris>,
    /// First received media track
    pub media: Option<MediaTrack>,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            stream: None,
            phase: PlaybackPhase::Resolving,
            status: PlaybackStatus::Resolving,
            host: None,
            uris: None,
            media: None,
        }
    }
}

enum Command {
    Play(StreamName),
    Stop,
    Shutdown,
}

/// Handle on a running playback engine
///
/// Must be created inside a Tokio runtime. Dropping the handle stops the
/// engine and releases any remote session in the background; call
/// [`PlaybackOrchestrator::shutdown`] to wait for that.
pub struct PlaybackOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<PlaybackSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl PlaybackOrchestrator {
    /// Start an engine backed by the configured directory and WebRTC
    pub fn spawn(config: PlayerConfig, mode: PlayerMode) -> Result<Self> {
        let directory = Arc::new(DirectoryClient::new(&config)?);
        let endpoints = Arc::new(RtcEndpointFactory::new(&config));
        Self::with_parts(config, mode, directory, endpoints)
    }

    /// Start an engine with explicit collaborators
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn with_parts(
        config: PlayerConfig,
        mode: PlayerMode,
        directory: Arc<dyn Directory>,
        endpoints: Arc<dyn EndpointFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PlaybackSnapshot::default());

        let driver = Driver {
            http: config.http_client()?,
            controller: ResolutionController::new(directory, config.retry_interval()),
            config,
            mode,
            endpoints,
            session: None,
            commands: commands_rx,
            snapshot: snapshot_tx,
        };

        info!(mode = %mode, "Playback orchestrator started");
        let task = tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            snapshots: snapshot_rx,
            task: Some(task),
        })
    }

    /// Play a stream, replacing whatever was playing
    pub fn play(&self, stream: impl Into<String>) -> Result<()> {
        let stream = StreamName::new(stream)?;
        self.send(Command::Play(stream))
    }

    /// Stop playing and release the current session
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Observe snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshots.clone()
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Tear down and wait for the engine task to finish
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);

        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                Error::SessionClosed(format!("orchestrator task ended abnormally: {}", e))
            })?;
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed("orchestrator is stopped".to_string()))
    }
}

/// State owned by the orchestrator task
struct Driver {
    config: PlayerConfig,
    mode: PlayerMode,
    http: reqwest::Client,
    endpoints: Arc<dyn EndpointFactory>,
    controller: ResolutionController,
    session: Option<NegotiationSession>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<PlaybackSnapshot>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Play(stream)) => self.play(stream).await,
                    Some(Command::Stop) => self.stop().await,
                    Some(Command::Shutdown) | None => break,
                },
                update = self.controller.next() => self.on_resolution(update).await,
                event = next_session_event(&mut self.session) => self.on_session(event).await,
            }
        }

        self.close_session().await;
        self.controller.reset();
        info!("Playback orchestrator stopped");
    }

    async fn play(&mut self, stream: StreamName) {
        if self.controller.stream() == Some(&stream) {
            debug!(stream = %stream, "Already playing stream");
            return;
        }

        self.close_session().await;
        self.controller.activate(stream.clone());
        self.publish(|s| {
            *s = PlaybackSnapshot {
                stream: Some(stream),
                ..PlaybackSnapshot::default()
            }
        });
    }

    async fn stop(&mut self) {
        self.close_session().await;
        self.controller.reset();
        self.publish(|s| *s = PlaybackSnapshot::default());
    }

    async fn on_resolution(&mut self, update: ResolutionUpdate) {
        match update {
            ResolutionUpdate::NodeSearching => self.publish(|s| {
                s.phase = PlaybackPhase::NodeSearching;
                s.status = PlaybackStatus::Resolving;
            }),
            ResolutionUpdate::Status(status) => {
                let phase = match status {
                    ResolutionStatus::NoStream | ResolutionStatus::Error => PlaybackPhase::NoSource,
                    _ => PlaybackPhase::Resolving,
                };
                self.publish(|s| {
                    s.phase = phase;
                    s.status = status.into();
                    s.host = None;
                    s.uris = None;
                });
            }
            ResolutionUpdate::HostReady(host) => self.on_host_ready(host).await,
        }
    }

    async fn on_host_ready(&mut self, host: String) {
        let Some(stream) = self.controller.stream().cloned() else {
            return;
        };

        // The old session belongs to the old host
        self.close_session().await;

        let uris = PlayerUris::new(&self.config.edge_scheme, &host, &stream);
        let status = match self.mode {
            PlayerMode::Whep => PlaybackStatus::Connecting,
            PlayerMode::Embedded => PlaybackStatus::Connected,
        };
        self.publish(|s| {
            s.phase = PlaybackPhase::Ready;
            s.status = status;
            s.host = Some(host.clone());
            s.uris = Some(uris);
            s.media = None;
        });

        if self.mode == PlayerMode::Embedded {
            return;
        }

        let mut session =
            NegotiationSession::new(self.http.clone(), &self.config.edge_scheme, &host, stream);
        let opened = session.open(self.endpoints.as_ref()).await;
        self.session = Some(session);

        if let Err(e) = opened {
            self.on_session_failure(&e.to_string()).await;
        }
    }

    async fn on_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.publish(|s| s.status = PlaybackStatus::Connected),
            SessionEvent::MediaAttached(track) => self.publish(|s| s.media = Some(track)),
            SessionEvent::Disconnected(connectivity) => {
                self.on_session_failure(&format!("connectivity {}", connectivity))
                    .await
            }
            SessionEvent::Failed(e) => {
                if !e.is_retryable() {
                    error!(error = %e, "Unexpected session failure");
                }
                self.on_session_failure(&e.to_string()).await
            }
        }
    }

    /// Release the failed session and its host, then re-resolve
    async fn on_session_failure(&mut self, reason: &str) {
        warn!(reason = %reason, "Media session failed, re-resolving");

        self.close_session().await;
        self.controller.invalidate();
        self.publish(|s| {
            s.phase = PlaybackPhase::Resolving;
            s.status = PlaybackStatus::Failed;
            s.host = None;
            s.uris = None;
            s.media = None;
        });
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    fn publish(&self, modify: impl FnOnce(&mut PlaybackSnapshot)) {
        self.snapshot.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            modify(snapshot);

            if before.status != snapshot.status {
                info!(
                    stream = ?snapshot.stream.as_ref().map(StreamName::as_str),
                    from = %before.status,
                    to = %snapshot.status,
                    "Playback status transition"
                );
            }
            before != *snapshot
        });
    }
}

async fn next_session_event(session: &mut Option<NegotiationSession>) -> SessionEvent {
    match session {
        Some(session) => session.next().await,
        None => futures::future::pending().await,
    }
}
