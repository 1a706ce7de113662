//! Scripted directory and endpoint fakes for unit tests

use crate::directory::{Directory, HostResult, SourceResult};
use crate::endpoint::{EndpointEvent, EndpointFactory, EventSink, MediaEndpoint};
use crate::stream::StreamName;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub(crate) const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=offer\r\n";
pub(crate) const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\ns=answer\r\n";

/// Directory answering from queued results
///
/// Each queue pops until one item is left, which then repeats. An empty queue
/// answers absent / no stream.
#[derive(Default)]
pub(crate) struct ScriptedDirectory {
    sources: Mutex<VecDeque<SourceResult>>,
    hosts: Mutex<VecDeque<HostResult>>,
    delay: Mutex<Duration>,
    requested: Mutex<Vec<String>>,
    source_calls: AtomicUsize,
    host_calls: AtomicUsize,
}

impl ScriptedDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_source(&self, result: SourceResult) {
        self.sources.lock().push_back(result);
    }

    pub(crate) fn push_host(&self, result: HostResult) {
        self.hosts.lock().push_back(result);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn source_calls(&self) -> usize {
        self.source_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn host_calls(&self) -> usize {
        self.host_calls.load(Ordering::SeqCst)
    }

    /// Stream names in call order, across both queries
    pub(crate) fn requested_streams(&self) -> Vec<String> {
        self.requested.lock().clone()
    }

    async fn record(&self, stream: &StreamName) {
        self.requested.lock().push(stream.as_str().to_string());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_of<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
        let mut queue = queue.lock();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Directory for ScriptedDirectory {
    async fn check_source(&self, stream: &StreamName) -> SourceResult {
        self.source_calls.fetch_add(1, Ordering::SeqCst);
        self.record(stream).await;
        Self::next_of(&self.sources).unwrap_or(SourceResult::Absent)
    }

    async fn resolve_host(&self, stream: &StreamName) -> HostResult {
        self.host_calls.fetch_add(1, Ordering::SeqCst);
        self.record(stream).await;
        Self::next_of(&self.hosts).unwrap_or_else(HostResult::no_stream)
    }
}

#[derive(Default)]
struct FakeState {
    sinks: Mutex<Vec<EventSink>>,
    answers: Mutex<Vec<String>>,
    created: AtomicUsize,
    closed: AtomicUsize,
    withhold_offer: AtomicBool,
    answer_delay: Mutex<Duration>,
    answer_started: Notify,
}

/// Endpoint factory whose endpoints answer immediately and record calls
#[derive(Clone, Default)]
pub(crate) struct FakeEndpointFactory {
    state: Arc<FakeState>,
}

impl FakeEndpointFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Endpoints will not emit an offer on their own
    pub(crate) fn without_offer(self) -> Self {
        self.state.withhold_offer.store(true, Ordering::SeqCst);
        self
    }

    /// Endpoints take `delay` to apply an answer
    pub(crate) fn with_answer_delay(self, delay: Duration) -> Self {
        *self.state.answer_delay.lock() = delay;
        self
    }

    /// Resolves once an endpoint has started applying an answer
    pub(crate) async fn answer_started(&self) {
        self.state.answer_started.notified().await;
    }

    /// Event sink of the most recently created endpoint
    pub(crate) fn last_sink(&self) -> Option<EventSink> {
        self.state.sinks.lock().last().cloned()
    }

    pub(crate) fn answers(&self) -> Vec<String> {
        self.state.answers.lock().clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Endpoints created and not yet closed
    pub(crate) fn open_endpoints(&self) -> usize {
        self.created() - self.closed()
    }
}

#[async_trait]
impl EndpointFactory for FakeEndpointFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn MediaEndpoint>> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.sinks.lock().push(events.clone());
        Ok(Arc::new(FakeEndpoint {
            state: Arc::clone(&self.state),
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeEndpoint {
    state: Arc<FakeState>,
    events: EventSink,
    closed: AtomicBool,
}

#[async_trait]
impl MediaEndpoint for FakeEndpoint {
    async fn start_offer(&self) -> Result<()> {
        if !self.state.withhold_offer.load(Ordering::SeqCst) {
            self.events
                .emit(EndpointEvent::OfferReady(OFFER_SDP.to_string()));
        }
        Ok(())
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        self.state.answer_started.notify_one();
        let delay = *self.state.answer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.answers.lock().push(sdp);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
