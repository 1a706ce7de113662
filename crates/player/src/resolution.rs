//! Status-driven edge resolution with a single-flight retry timer
//!
//! The controller turns repeated [`Directory`] queries into one current
//! `(host, status)` pair:
//!
//! ```text
//! activate(stream) ──► check_source ──absent──► NoStream ──retry──┐
//!                          │  └─failed──► Error ────────retry──────┤
//!                          ▼ present                               │
//!                     resolve_host ──FULL/failed──► retry ─────────┤
//!                          │                                       │
//!                          ▼ host                                  │
//!                        Ready (retries stop)      ◄───────────────┘
//! ```
//!
//! Lookups run as spawned tasks tagged with a generation number. Switching
//! streams aborts the in-flight lookup, cancels the pending retry and bumps
//! the generation, so any result that still arrives for the old stream is
//! dropped.

use crate::directory::{Directory, HostResult, ResolutionStatus, SourceResult};
use crate::stream::StreamName;
use crate::timer::RetryTimer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Progress reported by [`ResolutionController::next`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionUpdate {
    /// A source exists and the directory is being asked for an edge
    NodeSearching,
    /// Status changed without producing a host
    Status(ResolutionStatus),
    /// A new edge host was adopted
    HostReady(String),
}

#[derive(Debug)]
enum LookupStep {
    Source(SourceResult),
    Host(HostResult),
}

#[derive(Debug)]
struct LookupOutcome {
    generation: u64,
    step: LookupStep,
}

/// Drives directory lookups for one stream at a time
pub struct ResolutionController {
    directory: Arc<dyn Directory>,
    retry_interval: Duration,

    stream: Option<StreamName>,
    /// Bumped on every activation; lookups carry the value they started with
    generation: u64,
    host: String,
    status: ResolutionStatus,

    timer: RetryTimer,
    lookup: Option<JoinHandle<()>>,
    outcomes_tx: mpsc::UnboundedSender<LookupOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<LookupOutcome>,
}

impl ResolutionController {
    /// Create an idle controller
    pub fn new(directory: Arc<dyn Directory>, retry_interval: Duration) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        Self {
            directory,
            retry_interval,
            stream: None,
            generation: 0,
            host: String::new(),
            status: ResolutionStatus::Loading,
            timer: RetryTimer::new(),
            lookup: None,
            outcomes_tx,
            outcomes_rx,
        }
    }

    /// Stream currently being resolved
    pub fn stream(&self) -> Option<&StreamName> {
        self.stream.as_ref()
    }

    /// Current status
    pub fn status(&self) -> ResolutionStatus {
        self.status
    }

    /// Current host, only while `Ready`
    pub fn host(&self) -> Option<&str> {
        (self.status == ResolutionStatus::Ready).then_some(self.host.as_str())
    }

    /// Whether a retry is scheduled
    pub fn is_retry_pending(&self) -> bool {
        self.timer.is_pending()
    }

    /// Whether a directory lookup is outstanding
    pub fn is_lookup_in_flight(&self) -> bool {
        self.lookup
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start resolving a stream, abandoning whatever was in progress
    pub fn activate(&mut self, stream: StreamName) {
        self.abandon();
        info!(stream = %stream, generation = self.generation, "Resolving stream");

        self.stream = Some(stream);
        self.start_lookup();
    }

    /// Stop resolving and forget the stream
    pub fn reset(&mut self) {
        self.abandon();
        self.stream = None;
    }

    /// Discard the current host after the session using it failed
    ///
    /// A fresh lookup is scheduled after the retry interval rather than run
    /// immediately, so a failing edge is not hit again right away.
    pub fn invalidate(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if !self.host.is_empty() {
            info!(host = %self.host, "Discarding edge host");
        }
        self.host.clear();
        self.set_status(ResolutionStatus::Loading);
        self.schedule_retry();
    }

    /// Wait for the next change in resolution progress
    ///
    /// Fires scheduled retries as they fall due. Never completes while idle.
    /// Cancel safe.
    pub async fn next(&mut self) -> ResolutionUpdate {
        loop {
            tokio::select! {
                Some(outcome) = self.outcomes_rx.recv() => {
                    if let Some(update) = self.apply(outcome) {
                        return update;
                    }
                }
                _ = self.timer.fired() => {
                    debug!("Retry timer fired");
                    self.start_lookup();
                }
            }
        }
    }

    fn abandon(&mut self) {
        if self.timer.cancel() {
            debug!("Cancelled pending retry");
        }
        if let Some(lookup) = self.lookup.take() {
            lookup.abort();
        }
        self.generation += 1;
        self.host.clear();
        self.status = ResolutionStatus::Loading;
    }

    fn start_lookup(&mut self) {
        let Some(stream) = self.stream.clone() else {
            return;
        };
        if self.is_lookup_in_flight() {
            debug!(stream = %stream, "Lookup already in flight");
            return;
        }

        let directory = Arc::clone(&self.directory);
        let outcomes = self.outcomes_tx.clone();
        let generation = self.generation;

        self.lookup = Some(tokio::spawn(async move {
            let source = directory.check_source(&stream).await;
            let present = source.is_present();
            let sent = outcomes.send(LookupOutcome {
                generation,
                step: LookupStep::Source(source),
            });
            if sent.is_err() || !present {
                return;
            }

            let host = directory.resolve_host(&stream).await;
            let _ = outcomes.send(LookupOutcome {
                generation,
                step: LookupStep::Host(host),
            });
        }));
    }

    fn apply(&mut self, outcome: LookupOutcome) -> Option<ResolutionUpdate> {
        if outcome.generation != self.generation {
            debug!(
                stale = outcome.generation,
                current = self.generation,
                "Discarding stale lookup result"
            );
            return None;
        }

        match outcome.step {
            LookupStep::Source(SourceResult::Present(_)) => {
                self.set_status(ResolutionStatus::Loading);
                Some(ResolutionUpdate::NodeSearching)
            }
            LookupStep::Source(SourceResult::Absent) => {
                self.set_status(ResolutionStatus::NoStream);
                self.schedule_retry();
                Some(ResolutionUpdate::Status(ResolutionStatus::NoStream))
            }
            LookupStep::Source(SourceResult::Unavailable(_)) => {
                self.set_status(ResolutionStatus::Error);
                self.schedule_retry();
                Some(ResolutionUpdate::Status(ResolutionStatus::Error))
            }
            LookupStep::Host(result)
                if result.status == ResolutionStatus::Ready && !result.host.is_empty() =>
            {
                if self.status == ResolutionStatus::Ready && result.host == self.host {
                    return None;
                }
                self.timer.cancel();
                info!(host = %result.host, "Edge host resolved");
                self.host = result.host;
                self.set_status(ResolutionStatus::Ready);
                Some(ResolutionUpdate::HostReady(self.host.clone()))
            }
            LookupStep::Host(result) => {
                let status = match result.status {
                    ResolutionStatus::Ready => ResolutionStatus::NoStream,
                    other => other,
                };
                self.set_status(status);
                self.schedule_retry();
                Some(ResolutionUpdate::Status(status))
            }
        }
    }

    fn set_status(&mut self, status: ResolutionStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "Resolution status transition");
            self.status = status;
        }
    }

    fn schedule_retry(&mut self) {
        if self.timer.schedule(self.retry_interval) {
            debug!(delay_ms = self.retry_interval.as_millis() as u64, "Retry scheduled");
        }
    }
}

impl Drop for ResolutionController {
    fn drop(&mut self) {
        if let Some(lookup) = self.lookup.take() {
            lookup.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDirectory;
    use tokio::time::Instant;

    const INTERVAL: Duration = Duration::from_secs(2);

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_source_never_resolves_host() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Absent);
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));

        let mut last = Instant::now();
        for round in 0..4 {
            let update = controller.next().await;
            assert_eq!(update, ResolutionUpdate::Status(ResolutionStatus::NoStream));
            assert_eq!(controller.status(), ResolutionStatus::NoStream);
            assert!(controller.is_retry_pending());
            if round > 0 {
                assert!(last.elapsed() >= INTERVAL);
            }
            last = Instant::now();
        }

        assert_eq!(directory.source_calls(), 4);
        assert_eq!(directory.host_calls(), 0);
        assert_eq!(controller.host(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_then_token_becomes_ready() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Absent);
        directory.push_source(SourceResult::Present("token".to_string()));
        directory.push_host(HostResult::ready("edgeA"));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));

        assert_eq!(
            controller.next().await,
            ResolutionUpdate::Status(ResolutionStatus::NoStream)
        );
        assert_eq!(controller.next().await, ResolutionUpdate::NodeSearching);
        assert_eq!(controller.status(), ResolutionStatus::Loading);
        assert_eq!(
            controller.next().await,
            ResolutionUpdate::HostReady("edgeA".to_string())
        );

        assert_eq!(controller.status(), ResolutionStatus::Ready);
        assert_eq!(controller.host(), Some("edgeA"));
        assert!(!controller.is_retry_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_stops_retrying() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Present("token".to_string()));
        directory.push_host(HostResult::ready("edgeA"));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));
        controller.next().await;
        controller.next().await;

        let idle = tokio::time::timeout(Duration::from_secs(60), controller.next()).await;
        assert!(idle.is_err());
        assert_eq!(directory.source_calls(), 1);
        assert_eq!(directory.host_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_search_full_retries() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Present("token".to_string()));
        directory.push_host(HostResult::no_stream());
        directory.push_host(HostResult::ready("edgeB"));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));

        assert_eq!(controller.next().await, ResolutionUpdate::NodeSearching);
        assert_eq!(
            controller.next().await,
            ResolutionUpdate::Status(ResolutionStatus::NoStream)
        );
        assert!(controller.is_retry_pending());

        let before = Instant::now();
        assert_eq!(controller.next().await, ResolutionUpdate::NodeSearching);
        assert!(before.elapsed() >= INTERVAL);
        assert_eq!(
            controller.next().await,
            ResolutionUpdate::HostReady("edgeB".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_failure_is_error_status() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Unavailable("connection refused".to_string()));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));

        assert_eq!(
            controller.next().await,
            ResolutionUpdate::Status(ResolutionStatus::Error)
        );
        assert!(controller.is_retry_pending());
        assert_eq!(directory.host_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_change_discards_in_flight_lookup() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.set_delay(Duration::from_millis(500));
        directory.push_source(SourceResult::Present("token".to_string()));
        directory.push_host(HostResult::ready("edge-for-b"));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("a"));
        // Let the lookup for "a" start before switching
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.activate(stream("b"));

        assert_eq!(controller.next().await, ResolutionUpdate::NodeSearching);
        assert_eq!(
            controller.next().await,
            ResolutionUpdate::HostReady("edge-for-b".to_string())
        );
        assert_eq!(controller.stream().map(StreamName::as_str), Some("b"));
        assert_eq!(directory.requested_streams(), vec!["a", "b", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_change_cancels_pending_retry() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Absent);
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("a"));
        controller.next().await;
        assert!(controller.is_retry_pending());

        controller.activate(stream("b"));
        assert!(!controller.is_retry_pending());
        assert_eq!(controller.status(), ResolutionStatus::Loading);

        controller.next().await;
        // Exactly one timer, for the new stream
        assert!(controller.is_retry_pending());
        assert_eq!(directory.source_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_schedules_fresh_lookup() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Present("token".to_string()));
        directory.push_host(HostResult::ready("edgeA"));
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));
        controller.next().await;
        controller.next().await;
        assert_eq!(controller.host(), Some("edgeA"));

        controller.invalidate();
        assert_eq!(controller.host(), None);
        assert_eq!(controller.status(), ResolutionStatus::Loading);
        assert!(controller.is_retry_pending());
        assert!(!controller.is_lookup_in_flight());

        let before = Instant::now();
        assert_eq!(controller.next().await, ResolutionUpdate::NodeSearching);
        assert!(before.elapsed() >= INTERVAL);
        // Same host is adopted again because the old one was discarded
        assert_eq!(
            controller.next().await,
            ResolutionUpdate::HostReady("edgeA".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_goes_idle() {
        let directory = Arc::new(ScriptedDirectory::new());
        directory.push_source(SourceResult::Absent);
        let mut controller = ResolutionController::new(directory.clone(), INTERVAL);

        controller.activate(stream("golive"));
        controller.next().await;
        controller.reset();

        assert!(controller.stream().is_none());
        assert!(!controller.is_retry_pending());
        let idle = tokio::time::timeout(Duration::from_secs(30), controller.next()).await;
        assert!(idle.is_err());
        assert_eq!(directory.source_calls(), 1);
    }
}
