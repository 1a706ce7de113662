//! Edge resolution and WHEP session negotiation for live stream playback
//!
//! Given a stream name, this crate finds the edge server that should serve it
//! and negotiates a receive-only WebRTC session with that edge over WHEP.
//!
//! # Features
//!
//! - **Directory client**: source presence and edge host queries against the
//!   load-balancer directory
//! - **Resolution controller**: status-driven lookups with a single-flight
//!   retry timer; stale results are discarded on stream switch
//! - **WHEP negotiation**: one HTTP offer/answer exchange per session, with
//!   teardown of the server-side session on close
//! - **Playback orchestrator**: one background task composing the above behind
//!   an observable [`PlaybackSnapshot`]
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  PlaybackOrchestrator (one task, watch<Snapshot>)     │
//! │  ├─ ResolutionController                              │
//! │  │   ├─ Directory (DirectoryClient over HTTP)         │
//! │  │   └─ RetryTimer                                    │
//! │  └─ NegotiationSession (at most one live)             │
//! │      ├─ MediaEndpoint (receive-only RTCPeerConnection)│
//! │      └─ WHEP POST / DELETE against the edge           │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use edgeview_player::PlayerConfig;
//!
//! let config = PlayerConfig {
//!     retry_interval_ms: 1000,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.edge_scheme, "https");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use edgeview_player::{PlaybackOrchestrator, PlaybackStatus, PlayerConfig, PlayerMode};
//!
//! # async fn example() -> edgeview_player::Result<()> {
//! let player = PlaybackOrchestrator::spawn(PlayerConfig::default(), PlayerMode::Whep)?;
//! let mut snapshots = player.subscribe();
//!
//! player.play("golive+abc")?;
//! let _ = snapshots
//!     .wait_for(|s| s.status == PlaybackStatus::Connected)
//!     .await;
//!
//! player.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod endpoint;
pub mod error;
pub mod negotiation;
pub mod orchestrator;
pub mod resolution;
pub mod stream;
pub mod timer;

#[cfg(test)]
mod testing;

pub use config::PlayerConfig;
pub use directory::{Directory, DirectoryClient, HostResult, ResolutionStatus, SourceResult};
pub use endpoint::{
    Connectivity, EndpointEvent, EndpointFactory, EventSink, MediaEndpoint, MediaKind, MediaTrack,
    RtcEndpointFactory,
};
pub use error::{Error, Result};
pub use negotiation::{NegotiationSession, NegotiationState, SessionEvent, SessionHandle};
pub use orchestrator::{
    PlaybackOrchestrator, PlaybackPhase, PlaybackSnapshot, PlaybackStatus, PlayerMode,
};
pub use resolution::{ResolutionController, ResolutionUpdate};
pub use stream::{whep_url, PlayerUris, StreamName};
pub use timer::RetryTimer;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
