//! Test-Doubles für Engine, Router und Client
//!
//! `FakeHandleFactory` protokolliert jede Handle-Operation pro Peer und kann
//! einzelne Operationen fehlschlagen lassen.

use crate::call_engine::{
    CallEngine, CallEvent, CallPhase, DeviceError, EngineInput, HandleEventSink, HandleFactory,
    LocalTrack, MediaCapture, MediaConstraints, NegotiationError, NegotiationHandle, TrackKind,
};
use crate::identity::Identity;
use crate::signaling::{Action, Envelope, EnvelopeSink, IceCandidate, SendError, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub fn id(token: &str) -> Identity {
    Identity::new(token).unwrap()
}

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeMedia {
    failing: AtomicBool,
    acquisitions: AtomicUsize,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeMedia {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, DeviceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::NoInputDevice);
        }

        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(LocalTrack {
                id: format!("audio-{}", n),
                kind: TrackKind::Audio,
                label: "fake microphone".to_string(),
            });
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack {
                id: format!("video-{}", n),
                kind: TrackKind::Video,
                label: "fake camera".to_string(),
            });
        }
        Ok(tracks)
    }
}

// ============================================================================
// NEGOTIATION HANDLES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOp {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    Create,
    AddTrack,
    SetLocal,
    SetRemote,
    AddCandidate,
}

#[derive(Default)]
struct FactoryState {
    log: Vec<(Identity, HandleOp)>,
    attempts: Vec<(Identity, HandleOp)>,
    created: HashMap<Identity, usize>,
    sinks: HashMap<Identity, HandleEventSink>,
    failures: HashSet<FailOn>,
}

#[derive(Default)]
pub struct FakeHandleFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeHandleFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, op: FailOn) {
        self.state.lock().failures.insert(op);
    }

    /// Alle Operationen auf Handles für `peer`, in Aufrufreihenfolge
    pub fn ops(&self, peer: &Identity) -> Vec<HandleOp> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Wie [`FakeHandleFactory::ops`], aber inklusive abgelehnter Operationen
    pub fn attempts(&self, peer: &Identity) -> Vec<HandleOp> {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn created(&self, peer: &Identity) -> usize {
        self.state.lock().created.get(peer).copied().unwrap_or(0)
    }

    /// Event-Sink des zuletzt für `peer` erstellten Handles
    pub fn sink(&self, peer: &Identity) -> Option<HandleEventSink> {
        self.state.lock().sinks.get(peer).cloned()
    }
}

#[async_trait]
impl HandleFactory for FakeHandleFactory {
    async fn create(
        &self,
        peer: &Identity,
        events: HandleEventSink,
    ) -> Result<Box<dyn NegotiationHandle>, NegotiationError> {
        let mut state = self.state.lock();
        if state.failures.contains(&FailOn::Create) {
            return Err(NegotiationError::new("create", "injected failure"));
        }

        *state.created.entry(peer.clone()).or_default() += 1;
        state.sinks.insert(peer.clone(), events);

        Ok(Box::new(FakeHandle {
            peer: peer.clone(),
            state: self.state.clone(),
            counter: 0,
        }))
    }
}

struct FakeHandle {
    peer: Identity,
    state: Arc<Mutex<FactoryState>>,
    counter: usize,
}

impl FakeHandle {
    fn record(&self, op: HandleOp, fail: Option<FailOn>) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        state.attempts.push((self.peer.clone(), op.clone()));
        if let Some(fail) = fail {
            if state.failures.contains(&fail) {
                return Err(NegotiationError::new("fake", format!("{:?} rejected", fail)));
            }
        }
        state.log.push((self.peer.clone(), op));
        Ok(())
    }
}

#[async_trait]
impl NegotiationHandle for FakeHandle {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(HandleOp::AddTrack(track.kind), Some(FailOn::AddTrack))
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.counter += 1;
        self.record(HandleOp::CreateOffer, None)?;
        Ok(SessionDescription::offer(format!("v=0 offer {} {}", self.peer, self.counter)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.counter += 1;
        self.record(HandleOp::CreateAnswer, None)?;
        Ok(SessionDescription::answer(format!("v=0 answer {} {}", self.peer, self.counter)))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(HandleOp::SetLocal(description), Some(FailOn::SetLocal))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(HandleOp::SetRemote(description), Some(FailOn::SetRemote))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(HandleOp::AddCandidate(candidate), Some(FailOn::AddCandidate))
    }

    async fn close(&mut self) {
        let _ = self.record(HandleOp::Close, None);
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.sent.lock().iter().map(|e| e.action.clone()).collect()
    }

    pub fn last(&self) -> Option<Envelope> {
        self.sent.lock().last().cloned()
    }
}

impl EnvelopeSink for RecordingSink {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

// ============================================================================
// ENGINE FIXTURE
// ============================================================================

pub struct EngineFixture {
    pub engine: CallEngine,
    pub inputs: mpsc::UnboundedReceiver<EngineInput>,
    pub events: broadcast::Receiver<CallEvent>,
    pub media: Arc<FakeMedia>,
    pub factory: Arc<FakeHandleFactory>,
    pub sink: Arc<RecordingSink>,
}

impl EngineFixture {
    pub fn new(local: &str) -> Self {
        Self::build(local, None)
    }

    pub fn with_timeout(local: &str, timeout: Duration) -> Self {
        Self::build(local, Some(timeout))
    }

    fn build(local: &str, timeout: Option<Duration>) -> Self {
        let media = FakeMedia::new();
        let factory = FakeHandleFactory::new();
        let sink = RecordingSink::new();

        let (engine, inputs) =
            CallEngine::new(id(local), sink.clone(), media.clone(), factory.clone());
        let engine = engine.with_call_timeout(timeout);
        let events = engine.subscribe();

        Self {
            engine,
            inputs,
            events,
            media,
            factory,
            sink,
        }
    }

    /// Verarbeitet alle bereits eingereihten Handle-Events
    pub async fn pump(&mut self) {
        while let Ok(input) = self.inputs.try_recv() {
            self.engine.handle_input(input).await;
        }
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Phasenwechsel für `peer` seit dem letzten Drain
    pub fn phases(&mut self, peer: &Identity) -> Vec<CallPhase> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::StateChanged { peer: p, phase } if p == *peer => Some(phase),
                _ => None,
            })
            .collect()
    }
}
