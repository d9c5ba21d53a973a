//! Mock collaborators and harness helpers for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::call::{Call, CallContext};
use crate::error::TransportError;
use crate::events::{CallObserver, CallSnapshot};
use crate::manager::{CallManager, CallManagerConfig};
use crate::media::{
    MediaConstraints, MediaError, MediaFactory, MediaSession, MediaSource, MediaStream,
};
use crate::signaling::{CallId, Candidate, ChannelId, SessionDescription, Signal, SignalType};
use crate::state::CallDirection;
use crate::transport::SignalingTransport;

/// A distinct, realistic-looking candidate for tests.
pub fn candidate(n: u32) -> Candidate {
    Candidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 54321 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

/// One recorded transport send attempt.
#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub channel: ChannelId,
    pub signal: Signal,
    pub at: Instant,
    pub ok: bool,
}

#[derive(Default)]
struct TransportState {
    attempts: Vec<SendAttempt>,
    fail_remaining: usize,
}

/// Recording transport with a programmable failure schedule: the next
/// `n` sends fail, everything after succeeds.
#[derive(Default)]
pub struct MockSignalingTransport {
    state: Mutex<TransportState>,
}

impl MockSignalingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` send attempts fail.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_remaining = n;
    }

    /// Clear any remaining scripted failures.
    pub async fn heal(&self) {
        self.state.lock().await.fail_remaining = 0;
    }

    /// Every attempt, failed ones included, in order.
    pub async fn attempts(&self) -> Vec<SendAttempt> {
        self.state.lock().await.attempts.clone()
    }

    pub async fn attempt_count(&self) -> usize {
        self.state.lock().await.attempts.len()
    }

    /// Successfully delivered sends, in order.
    pub async fn delivered(&self) -> Vec<SendAttempt> {
        self.state
            .lock()
            .await
            .attempts
            .iter()
            .filter(|a| a.ok)
            .cloned()
            .collect()
    }

    /// Delivered signals of one type, in order.
    pub async fn delivered_of_type(&self, signal_type: SignalType) -> Vec<SendAttempt> {
        self.delivered()
            .await
            .into_iter()
            .filter(|a| a.signal.signal_type() == signal_type)
            .collect()
    }

    /// All attempts (including failures) of one type, in order.
    pub async fn attempts_of_type(&self, signal_type: SignalType) -> Vec<SendAttempt> {
        self.attempts()
            .await
            .into_iter()
            .filter(|a| a.signal.signal_type() == signal_type)
            .collect()
    }

    /// Every candidate that made it onto the wire, flattened in
    /// delivery order.
    pub async fn candidates_delivered(&self) -> Vec<Candidate> {
        self.delivered()
            .await
            .into_iter()
            .filter_map(|a| match a.signal {
                Signal::Candidates(c) => Some(c.candidates),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for MockSignalingTransport {
    async fn send_signal(
        &self,
        channel: &ChannelId,
        signal: &Signal,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let ok = if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            false
        } else {
            true
        };
        state.attempts.push(SendAttempt {
            channel: channel.clone(),
            signal: signal.clone(),
            at: Instant::now(),
            ok,
        });
        if ok {
            Ok(())
        } else {
            Err(TransportError::Send("scripted failure".into()))
        }
    }
}

/// Opaque stream handle that remembers whether it was released.
pub struct MockMediaStream {
    id: String,
    stopped: AtomicBool,
}

impl MockMediaStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl MediaStream for MockMediaStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Media source handing out fresh mock streams, optionally gated or
/// failing.
#[derive(Default)]
pub struct MockMediaSource {
    counter: AtomicU64,
    fail: AtomicBool,
    gate: std::sync::Mutex<Option<Arc<Semaphore>>>,
    acquired: std::sync::Mutex<Vec<Arc<MockMediaStream>>>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every acquisition fail with a capture error.
    pub fn fail_capture(&self) {
        self.fail.store(true, Ordering::Relaxed);
    }

    /// Hold acquisitions until [`release_acquire`](Self::release_acquire)
    /// grants them through.
    pub fn gate_acquire(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one gated acquisition proceed.
    pub fn release_acquire(&self) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Streams handed out so far.
    pub fn streams(&self) -> Vec<Arc<MockMediaStream>> {
        self.acquired.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate never closed").forget();
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(MediaError::Capture("mock capture denied".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = MockMediaStream::new(format!("local-{n}"));
        self.acquired.lock().unwrap().push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Recording media session, with an optional gate on remote-description
/// application for exercising stale completions.
#[derive(Default)]
pub struct MockMediaSession {
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    added_streams: std::sync::Mutex<Vec<Arc<dyn MediaStream>>>,
    remote_candidates: Mutex<Vec<Candidate>>,
    closed: AtomicBool,
    remote_description_gate: std::sync::Mutex<Option<Arc<Semaphore>>>,
}

impl MockMediaSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().await.clone()
    }

    pub async fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().await.clone()
    }

    pub async fn remote_candidates(&self) -> Vec<Candidate> {
        self.remote_candidates.lock().await.clone()
    }

    pub fn added_stream_ids(&self) -> Vec<String> {
        self.added_streams
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Hold `set_remote_description` calls until released.
    pub fn gate_remote_description(&self) {
        *self.remote_description_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one gated `set_remote_description` complete.
    pub fn release_remote_description(&self) {
        if let Some(gate) = self.remote_description_gate.lock().unwrap().as_ref() {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0"))
    }

    async fn create_answer(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer("v=0\r\no=- 2 2 IN IP4 0.0.0.0"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.local_descriptions.lock().await.push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let gate = self.remote_description_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate never closed").forget();
        }
        self.remote_descriptions.lock().await.push(description);
        Ok(())
    }

    async fn add_stream(&self, stream: Arc<dyn MediaStream>) {
        self.added_streams.lock().unwrap().push(stream);
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), MediaError> {
        self.remote_candidates.lock().await.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MockMediaFactory {
    sessions: std::sync::Mutex<Vec<Arc<MockMediaSession>>>,
}

impl MockMediaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sessions(&self) -> Vec<Arc<MockMediaSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockMediaSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

impl MediaFactory for MockMediaFactory {
    fn create_session(&self) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = Arc::new(MockMediaSession::default());
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Observer that records every notification it receives.
#[derive(Default)]
pub struct RecordingObserver {
    incoming: Mutex<Vec<CallSnapshot>>,
    ended: Mutex<Vec<CallSnapshot>>,
    replaced: Mutex<Vec<(CallSnapshot, CallSnapshot)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn incoming(&self) -> Vec<CallSnapshot> {
        self.incoming.lock().await.clone()
    }

    pub async fn ended(&self) -> Vec<CallSnapshot> {
        self.ended.lock().await.clone()
    }

    pub async fn replaced(&self) -> Vec<(CallSnapshot, CallSnapshot)> {
        self.replaced.lock().await.clone()
    }
}

#[async_trait]
impl CallObserver for RecordingObserver {
    async fn on_incoming_call(&self, call: CallSnapshot) {
        self.incoming.lock().await.push(call);
    }

    async fn on_call_ended(&self, call: CallSnapshot) {
        self.ended.lock().await.push(call);
    }

    async fn on_call_replaced(&self, replaced: CallSnapshot, replacement: CallSnapshot) {
        self.replaced.lock().await.push((replaced, replacement));
    }
}

/// Bundle of mocks wired together, plus factories for calls and
/// managers that share them.
pub struct TestHarness {
    pub transport: Arc<MockSignalingTransport>,
    pub media_source: Arc<MockMediaSource>,
    pub media_factory: Arc<MockMediaFactory>,
    pub observer: Arc<RecordingObserver>,
    config: CallManagerConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        let observer = RecordingObserver::new();
        Self {
            transport: MockSignalingTransport::new(),
            media_source: MockMediaSource::new(),
            media_factory: MockMediaFactory::new(),
            config: CallManagerConfig {
                observer: Some(observer.clone() as Arc<dyn CallObserver>),
                ..Default::default()
            },
            observer,
        }
    }

    pub fn with_invite_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.invite_lifetime = lifetime;
        self
    }

    pub fn manager(&self) -> Arc<CallManager> {
        CallManager::new(
            self.transport.clone(),
            self.media_source.clone(),
            self.media_factory.clone(),
            self.config.clone(),
        )
    }

    pub(crate) fn new_call(&self, id: CallId, direction: CallDirection) -> Arc<Call> {
        Call::new(
            id,
            ChannelId::new("!test-room"),
            direction,
            Arc::new(CallContext {
                transport: self.transport.clone(),
                media_source: self.media_source.clone(),
                media_factory: self.media_factory.clone(),
                observer: self.config.observer.clone(),
                invite_lifetime: self.config.invite_lifetime,
                answer_constraints: self.config.answer_constraints,
            }),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
