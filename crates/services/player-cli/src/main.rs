//! Command-line player entry point
//!
//! Resolves the edge for a stream, negotiates a WHEP session with it and
//! drains the received RTP until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Play a stream through the default directory
//! cargo run -p edgeview-player-cli -- golive+abc
//!
//! # Only resolve the edge and print the embedded player URIs
//! cargo run -p edgeview-player-cli -- golive+abc --mode embedded
//!
//! # Use a config file and a custom directory
//! cargo run -p edgeview-player-cli -- golive+abc \
//!   --config ./edgeview.toml \
//!   --directory-url https://lb.example.com
//!
//! # Dump directory metadata and exit
//! cargo run -p edgeview-player-cli -- --metadata
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use edgeview_player::{
    DirectoryClient, MediaTrack, PlaybackOrchestrator, PlaybackSnapshot, PlayerConfig, PlayerMode,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Edge-resolving WHEP stream player
///
/// Finds the edge serving a stream through the load-balancer directory and
/// receives its media over WebRTC.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream name to play
    #[arg(required_unless_present = "metadata")]
    stream: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "EDGEVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Load-balancer directory base URL
    #[arg(long)]
    directory_url: Option<String>,

    /// Player mode: 'whep' negotiates media, 'embedded' only resolves the edge
    #[arg(short, long, default_value = "whep", env = "EDGEVIEW_MODE")]
    mode: PlayerMode,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Option<Vec<String>>,

    /// Delay between resolution attempts in milliseconds
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Print directory metadata as JSON and exit
    #[arg(long)]
    metadata: bool,
}

impl Args {
    /// Layer command-line overrides over file and environment configuration
    fn player_config(&self) -> anyhow::Result<PlayerConfig> {
        let mut config = PlayerConfig::load(self.config.as_ref())
            .with_context(|| format!("Failed to load configuration from {:?}", self.config))?;

        if let Some(url) = &self.directory_url {
            config.directory_url = url.clone();
        }
        if let Some(servers) = &self.stun_servers {
            config.stun_servers = servers.clone();
        }
        if let Some(ms) = self.retry_interval_ms {
            config.retry_interval_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.player_config()?;

    info!(
        version = edgeview_player::version(),
        mode = %args.mode,
        directory_url = %config.directory_url,
        "edgeview-play starting"
    );

    if args.metadata {
        let directory = DirectoryClient::new(&config)?;
        let metadata = directory.fetch_metadata().await?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    let Some(stream) = args.stream.clone() else {
        bail!("a stream name is required");
    };

    let player = PlaybackOrchestrator::spawn(config, args.mode)?;
    let snapshots = player.subscribe();
    player.play(stream)?;

    tokio::select! {
        _ = report(snapshots) => warn!("Playback engine stopped unexpectedly"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal");
        }
    }

    player.shutdown().await?;
    info!("edgeview-play shut down gracefully");
    Ok(())
}

/// Log snapshot changes and drain each newly attached track
async fn report(mut snapshots: watch::Receiver<PlaybackSnapshot>) {
    let mut last_status = None;
    let mut last_media = None;

    loop {
        let snapshot = snapshots.borrow_and_update().clone();

        if last_status != Some(snapshot.status) {
            info!(
                status = %snapshot.status,
                phase = ?snapshot.phase,
                host = snapshot.host.as_deref().unwrap_or("-"),
                "Playback status"
            );
            if let Some(uris) = &snapshot.uris {
                info!(whep = %uris.whep, html = %uris.html, "Edge player URIs");
            }
            last_status = Some(snapshot.status);
        }

        if snapshot.media != last_media {
            if let Some(track) = &snapshot.media {
                tokio::spawn(drain(track.clone()));
            }
            last_media = snapshot.media;
        }

        if snapshots.changed().await.is_err() {
            return;
        }
    }
}

/// Read RTP from a track until it ends, logging throughput
async fn drain(track: MediaTrack) {
    let Some(remote) = track.remote().cloned() else {
        return;
    };

    info!(kind = %track.kind(), id = track.id(), "Receiving media");

    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.tick().await;

    loop {
        tokio::select! {
            read = remote.read_rtp() => match read {
                Ok((packet, _)) => {
                    packets += 1;
                    bytes += packet.payload.len() as u64;
                }
                Err(e) => {
                    info!(kind = %track.kind(), packets, bytes, error = %e, "Media track ended");
                    return;
                }
            },
            _ = ticker.tick() => {
                info!(kind = %track.kind(), packets, bytes, "Media received");
            }
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
