//! Call Engine - Negotiation State Machine
//!
//! Verwaltet alle Call Sessions (höchstens eine lebende Session pro Peer) und
//! treibt den Offer/Answer/Candidate-Austausch für jede Session genau einmal
//! zu Ende.
//!
//! Regeln die für jede Session gelten:
//! - Die Remote Description wird höchstens einmal gesetzt.
//! - ICE Candidates vor der Remote Description werden gepuffert und danach
//!   in Empfangsreihenfolge genau einmal angewendet.
//! - Ein Offer/Answer wird nur gesendet, wenn die Local Description
//!   tatsächlich gesetzt wurde.
//! - Jeder Fehler eines Versuchs schließt die Session und gibt das Handle frei.
//!
//! Ein zweiter Anruf zu einem Peer mit lebender Session wird mit
//! [`CallError::AlreadyInCall`] abgelehnt.

use super::handle::{
    ConnectionState, EngineInput, HandleEvent, HandleEventKind, HandleEventSink, HandleFactory,
    NegotiationError,
};
use super::media::{DeviceError, MediaCapture, MediaConstraints, RemoteTrack};
use super::session::{CallPhase, CallSession, Direction};
use crate::identity::Identity;
use crate::signaling::{
    Action, AnswerPayload, CandidatePayload, Envelope, EnvelopeSink, IceCandidate, OfferPayload,
    SendError, SessionDescription,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Obergrenze für gepufferte Candidates pro Session
pub const MAX_PENDING_CANDIDATES: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Already in a call with {0}")]
    AlreadyInCall(Identity),

    #[error("Unknown peer: {0}")]
    UnknownPeer(Identity),

    #[error("No call with {0}")]
    NoSession(Identity),

    #[error("Call with {peer} is {phase}")]
    InvalidPhase { peer: Identity, phase: CallPhase },

    #[error("Signaling send failed: {0}")]
    Send(#[from] SendError),

    #[error("Call not connected within {0:?}")]
    Timeout(Duration),

    #[error("Connection to signaling relay lost")]
    ConnectionLost,
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Warum eine Session geschlossen wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LocalHangup,
    RemoteHangup,
    Denied,
    Cancelled,
    /// Durch einen neuen Versuch mit demselben Peer ersetzt
    Superseded,
    ConnectionClosed,
    Failed(CallError),
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        peer: Identity,
        phase: CallPhase,
    },
    /// Eingehender Anruf wartet auf accept/deny
    IncomingCall {
        peer: Identity,
        room: Option<String>,
    },
    /// Alle bisher empfangenen Remote Tracks der Session
    RemoteMedia {
        peer: Identity,
        tracks: Vec<RemoteTrack>,
    },
    Closed {
        peer: Identity,
        reason: CloseReason,
    },
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    local: Identity,
    sessions: HashMap<Identity, CallSession>,
    outbound: Arc<dyn EnvelopeSink>,
    media: Arc<dyn MediaCapture>,
    factory: Arc<dyn HandleFactory>,
    constraints: MediaConstraints,
    call_timeout: Option<Duration>,
    input_tx: mpsc::UnboundedSender<EngineInput>,
    event_tx: broadcast::Sender<CallEvent>,
    next_attempt: u64,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    ///
    /// Der zurückgegebene Receiver liefert Handle-Events und Timer, die von
    /// der Event-Loop an [`CallEngine::handle_input`] übergeben werden.
    pub fn new(
        local: Identity,
        outbound: Arc<dyn EnvelopeSink>,
        media: Arc<dyn MediaCapture>,
        factory: Arc<dyn HandleFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineInput>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);

        let engine = Self {
            local,
            sessions: HashMap::new(),
            outbound,
            media,
            factory,
            constraints: MediaConstraints::default(),
            call_timeout: None,
            input_tx,
            event_tx,
            next_attempt: 1,
        };

        (engine, input_rx)
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sessions die nicht innerhalb von `timeout` verbunden sind werden geschlossen
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.event_tx.clone()
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Phase der Session mit `peer` (`Idle` wenn keine existiert)
    pub fn phase(&self, peer: &Identity) -> CallPhase {
        self.sessions
            .get(peer)
            .map(|s| s.phase())
            .unwrap_or(CallPhase::Idle)
    }

    pub fn session(&self, peer: &Identity) -> Option<&CallSession> {
        self.sessions.get(peer)
    }

    pub fn active_peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    // ========================================================================
    // LOCAL INTENTS
    // ========================================================================

    /// Startet einen ausgehenden Anruf (sendet die Einladung)
    pub async fn initiate_call(
        &mut self,
        peer: &Identity,
        room: Option<String>,
    ) -> Result<(), CallError> {
        if *peer == self.local {
            return Err(CallError::UnknownPeer(peer.clone()));
        }

        if let Some(existing) = self.sessions.get(peer) {
            tracing::warn!(
                "Rejecting call to {}: session already {}",
                peer,
                existing.phase()
            );
            return Err(CallError::AlreadyInCall(peer.clone()));
        }

        let mut session =
            CallSession::new(peer.clone(), Direction::Outgoing, self.attempt_id(), room);

        self.notify(&session, Action::OutgoingCall)?;

        tracing::info!("Calling {}", peer);
        transition(&self.event_tx, &mut session, CallPhase::OutgoingPending);
        self.arm_timeout(&session);
        self.sessions.insert(peer.clone(), session);

        Ok(())
    }

    /// Akzeptiert einen eingehenden Anruf
    pub async fn accept_incoming_call(&mut self, peer: &Identity) -> Result<(), CallError> {
        let phase = self.phase(peer);
        if phase != CallPhase::IncomingPending {
            return Err(if phase == CallPhase::Idle {
                CallError::NoSession(peer.clone())
            } else {
                CallError::InvalidPhase {
                    peer: peer.clone(),
                    phase,
                }
            });
        }

        let Some(mut session) = self.sessions.remove(peer) else {
            return Err(CallError::NoSession(peer.clone()));
        };

        tracing::info!("Accepting call from {}", peer);

        let result = match session.pending_offer.take() {
            Some(offer) => self.negotiate_answer(&mut session, offer).await,
            None => self.accept_invitation(&mut session).await,
        };

        self.settle(session, result.clone()).await;
        result
    }

    /// Lehnt einen eingehenden Anruf ab (es wird kein Handle erstellt)
    pub async fn deny_incoming_call(&mut self, peer: &Identity) -> Result<(), CallError> {
        match self.phase(peer) {
            CallPhase::IncomingPending => {}
            CallPhase::Idle => return Err(CallError::NoSession(peer.clone())),
            phase => {
                return Err(CallError::InvalidPhase {
                    peer: peer.clone(),
                    phase,
                })
            }
        }

        if let Some(session) = self.sessions.remove(peer) {
            tracing::info!("Denying call from {}", peer);
            if let Err(e) = self.notify(&session, Action::DenyIncomingCall) {
                tracing::warn!("Failed to send deny to {}: {}", peer, e);
            }
            self.finish(session, CloseReason::Denied).await;
        }

        Ok(())
    }

    /// Beendet die Session mit `peer` und benachrichtigt den Peer
    pub async fn hangup(&mut self, peer: &Identity) -> Result<(), CallError> {
        let session = self
            .sessions
            .remove(peer)
            .ok_or_else(|| CallError::NoSession(peer.clone()))?;

        let action = match session.phase() {
            CallPhase::OutgoingPending => Action::CancelOutgoingCall,
            CallPhase::IncomingPending => Action::DenyIncomingCall,
            _ => Action::RemovePeer,
        };

        tracing::info!("Hanging up call with {}", peer);
        if let Err(e) = self.notify(&session, action) {
            tracing::warn!("Failed to notify {} about hangup: {}", peer, e);
        }

        self.finish(session, CloseReason::LocalHangup).await;
        Ok(())
    }

    /// Legt alle Sessions auf (z.B. beim Beenden)
    pub async fn hangup_all(&mut self) {
        for peer in self.active_peers() {
            let _ = self.hangup(&peer).await;
        }
    }

    /// Relay-Verbindung verloren: nicht verbundene Sessions können nicht
    /// mehr verhandelt werden und werden geschlossen
    pub async fn on_transport_lost(&mut self) {
        let pending: Vec<Identity> = self
            .sessions
            .values()
            .filter(|s| s.phase() != CallPhase::Connected)
            .map(|s| s.peer().clone())
            .collect();

        for peer in pending {
            self.close_peer(&peer, CloseReason::Failed(CallError::ConnectionLost))
                .await;
        }
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    /// Einladung (`incoming-call` / `outgoing-call`) vom Peer
    pub async fn on_invitation(&mut self, from: &Identity, room: Option<String>) {
        let existing = self.sessions.get(from).map(|s| s.phase());

        match existing {
            None => self.open_incoming(from, room, None),
            Some(CallPhase::IncomingPending) => {
                tracing::debug!("Duplicate invitation from {}", from);
            }
            // Beide Seiten rufen gleichzeitig an: die größere Identität gibt nach
            Some(CallPhase::OutgoingPending) if self.local > *from => {
                tracing::info!("Invitation glare with {}, yielding", from);
                self.close_peer(from, CloseReason::Superseded).await;
                self.open_incoming(from, room, None);
            }
            Some(phase) => {
                tracing::warn!("Ignoring invitation from {}: session already {}", from, phase);
            }
        }
    }

    /// SDP Offer vom Peer
    pub async fn on_offer(
        &mut self,
        from: &Identity,
        room: Option<String>,
        offer: SessionDescription,
    ) {
        let Some(mut session) = self.sessions.remove(from) else {
            // Offer ohne vorherige Einladung gilt selbst als Einladung
            self.open_incoming(from, room, Some(offer));
            return;
        };

        match session.phase() {
            CallPhase::IncomingPending => {
                if session.pending_offer.is_none() {
                    session.pending_offer = Some(offer);
                } else {
                    tracing::debug!("Ignoring duplicate offer from {}", from);
                }
                self.sessions.insert(from.clone(), session);
            }
            // Peer hat die Einladung direkt mit einem Offer angenommen
            CallPhase::OutgoingPending => {
                let result = self.negotiate_answer(&mut session, offer).await;
                self.settle(session, result).await;
            }
            // Einladung angenommen, Offer war noch ausstehend
            CallPhase::Negotiating
                if session.direction() == Direction::Incoming
                    && !session.remote_description_set() =>
            {
                let result = self.negotiate_answer(&mut session, offer).await;
                self.settle(session, result).await;
            }
            phase => {
                tracing::debug!(
                    "Ignoring offer from {} in phase {} (remote description set: {})",
                    from,
                    phase,
                    session.remote_description_set()
                );
                self.sessions.insert(from.clone(), session);
            }
        }
    }

    /// SDP Answer vom Peer
    pub async fn on_answer(&mut self, from: &Identity, answer: SessionDescription) {
        let Some(mut session) = self.sessions.remove(from) else {
            tracing::debug!("Dropping answer from {}: no session", from);
            return;
        };

        if session.phase() != CallPhase::OfferSent || session.remote_description_set() {
            tracing::debug!(
                "Ignoring answer from {} in phase {} (remote description set: {})",
                from,
                session.phase(),
                session.remote_description_set()
            );
            self.sessions.insert(from.clone(), session);
            return;
        }

        let result = self.apply_answer(&mut session, answer).await;
        self.settle(session, result).await;
    }

    /// ICE Candidate vom Peer
    pub async fn on_ice_candidate(&mut self, from: &Identity, candidate: IceCandidate) {
        let Some(mut session) = self.sessions.remove(from) else {
            tracing::debug!("Dropping stale ICE candidate from {}", from);
            return;
        };

        if !session.remote_description_set() {
            if session.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                tracing::warn!(
                    "Candidate buffer for {} full ({}), dropping candidate",
                    from,
                    MAX_PENDING_CANDIDATES
                );
            } else {
                tracing::debug!("Buffering ICE candidate from {}", from);
                session.pending_candidates.push_back(candidate);
            }
            self.sessions.insert(from.clone(), session);
            return;
        }

        let result = match session.handle_mut() {
            Some(handle) => handle
                .add_ice_candidate(candidate)
                .await
                .map_err(CallError::from),
            None => Err(CallError::InvalidPhase {
                peer: from.clone(),
                phase: session.phase(),
            }),
        };
        self.settle(session, result).await;
    }

    /// Peer hat unsere Einladung angenommen
    pub async fn on_accepted(&mut self, from: &Identity) {
        let Some(mut session) = self.sessions.remove(from) else {
            tracing::debug!("Dropping accept from {}: no session", from);
            return;
        };

        if session.phase() != CallPhase::OutgoingPending {
            tracing::debug!("Ignoring accept from {} in phase {}", from, session.phase());
            self.sessions.insert(from.clone(), session);
            return;
        }

        let result = self.negotiate_offer(&mut session).await;
        self.settle(session, result).await;
    }

    /// Peer hat unsere Einladung abgelehnt (nur vor der Annahme gültig)
    pub async fn on_denied(&mut self, from: &Identity) {
        match self.phase(from) {
            CallPhase::OutgoingPending => self.close_peer(from, CloseReason::Denied).await,
            phase => tracing::warn!("Ignoring deny from {} in phase {}", from, phase),
        }
    }

    /// Peer hat seine Einladung zurückgezogen
    pub async fn on_cancelled(&mut self, from: &Identity) {
        let cancellable = self.sessions.get(from).is_some_and(|s| {
            s.direction() == Direction::Incoming
                && matches!(
                    s.phase(),
                    CallPhase::IncomingPending | CallPhase::Negotiating
                )
        });

        if cancellable {
            self.close_peer(from, CloseReason::Cancelled).await;
        } else {
            tracing::warn!("Ignoring cancel from {} in phase {}", from, self.phase(from));
        }
    }

    /// Peer hat sich abgemeldet oder den Anruf beendet
    pub async fn on_peer_gone(&mut self, from: &Identity) {
        self.close_peer(from, CloseReason::RemoteHangup).await;
    }

    // ========================================================================
    // HANDLE EVENTS / TIMERS
    // ========================================================================

    /// Verarbeitet ein Handle-Event oder einen abgelaufenen Timer
    pub async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Handle(event) => self.on_handle_event(event).await,
            EngineInput::Timeout { peer, attempt } => self.on_timeout(&peer, attempt).await,
        }
    }

    async fn on_handle_event(&mut self, event: HandleEvent) {
        let HandleEvent {
            peer,
            attempt,
            kind,
        } = event;

        let current = self.sessions.get(&peer).map(|s| s.attempt());
        if current != Some(attempt) {
            tracing::debug!("Dropping event of stale handle for {}: {:?}", peer, kind);
            return;
        }

        match kind {
            HandleEventKind::IceCandidateGenerated(candidate) => {
                if let Some(session) = self.sessions.get(&peer) {
                    let payload = CandidatePayload { candidate };
                    if let Err(e) = self.send_payload(session, Action::IceCandidate, &payload) {
                        tracing::warn!("Failed to send ICE candidate to {}: {}", peer, e);
                    }
                }
            }
            HandleEventKind::RemoteTrackAdded(track) => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    tracing::info!("Remote {} track from {}", track.kind, peer);
                    session.remote_tracks.push(track);
                    let _ = self.event_tx.send(CallEvent::RemoteMedia {
                        peer: peer.clone(),
                        tracks: session.remote_tracks.clone(),
                    });
                }
            }
            HandleEventKind::ConnectionStateChanged(state) => match state {
                ConnectionState::Connected => {
                    if let Some(session) = self.sessions.get_mut(&peer) {
                        transition(&self.event_tx, session, CallPhase::Connected);
                    }
                }
                ConnectionState::Failed => {
                    let error = NegotiationError::new("connect", "peer connection failed");
                    self.close_peer(&peer, CloseReason::Failed(error.into()))
                        .await;
                }
                ConnectionState::Closed => {
                    self.close_peer(&peer, CloseReason::ConnectionClosed).await;
                }
                other => {
                    tracing::debug!("Peer connection with {} is {:?}", peer, other);
                }
            },
        }
    }

    async fn on_timeout(&mut self, peer: &Identity, attempt: u64) {
        let expired = self
            .sessions
            .get(peer)
            .map(|s| s.attempt() == attempt && s.phase() != CallPhase::Connected)
            .unwrap_or(false);

        if expired {
            let timeout = self.call_timeout.unwrap_or_default();
            tracing::info!("Call with {} timed out", peer);
            if let Some(session) = self.sessions.remove(peer) {
                if let Err(e) = self.notify(&session, Action::RemovePeer) {
                    tracing::debug!("Failed to notify {} about timeout: {}", peer, e);
                }
                self.finish(session, CloseReason::Failed(CallError::Timeout(timeout)))
                    .await;
            }
        }
    }

    // ========================================================================
    // NEGOTIATION STEPS
    // ========================================================================

    /// Eingehende Einladung ohne Offer annehmen: Handle vorbereiten, accept
    /// senden und auf das Offer warten
    async fn accept_invitation(&self, session: &mut CallSession) -> Result<(), CallError> {
        transition(&self.event_tx, session, CallPhase::Negotiating);
        self.prepare_handle(session).await?;
        self.notify(session, Action::AcceptIncomingCall)?;
        Ok(())
    }

    /// Offer erzeugen, lokal setzen und senden
    async fn negotiate_offer(&self, session: &mut CallSession) -> Result<(), CallError> {
        transition(&self.event_tx, session, CallPhase::Negotiating);
        self.prepare_handle(session).await?;

        if session.local_description_set() {
            return Ok(());
        }

        let handle = self.require_handle(session)?;
        let offer = handle.create_offer().await?;
        handle.set_local_description(offer.clone()).await?;
        session.local_description_set = true;

        self.send_payload(session, Action::Offer, &OfferPayload { offer })?;
        transition(&self.event_tx, session, CallPhase::OfferSent);

        self.replay_candidates(session).await
    }

    /// Offer anwenden, Answer erzeugen, lokal setzen und senden
    async fn negotiate_answer(
        &self,
        session: &mut CallSession,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        transition(&self.event_tx, session, CallPhase::Negotiating);
        self.prepare_handle(session).await?;

        if !self.apply_remote_description(session, offer).await? {
            return Ok(());
        }
        if session.local_description_set() {
            return Ok(());
        }

        let handle = self.require_handle(session)?;
        let answer = handle.create_answer().await?;
        handle.set_local_description(answer.clone()).await?;
        session.local_description_set = true;

        self.send_payload(session, Action::Answer, &AnswerPayload { answer })?;
        transition(&self.event_tx, session, CallPhase::AnswerSent);
        Ok(())
    }

    async fn apply_answer(
        &self,
        session: &mut CallSession,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.apply_remote_description(session, answer).await? {
            transition(&self.event_tx, session, CallPhase::Negotiating);
        }
        Ok(())
    }

    /// Setzt die Remote Description höchstens einmal
    ///
    /// Gibt `false` zurück wenn sie bereits gesetzt war.
    async fn apply_remote_description(
        &self,
        session: &mut CallSession,
        description: SessionDescription,
    ) -> Result<bool, CallError> {
        if session.remote_description_set() {
            tracing::debug!(
                "Remote description for {} already set, ignoring {}",
                session.peer(),
                description.kind
            );
            return Ok(false);
        }

        self.require_handle(session)?
            .set_remote_description(description)
            .await?;
        session.remote_description_set = true;

        self.replay_candidates(session).await?;
        Ok(true)
    }

    /// Gepufferte Candidates in Empfangsreihenfolge anwenden und Puffer leeren
    async fn replay_candidates(&self, session: &mut CallSession) -> Result<(), CallError> {
        if !session.remote_description_set() || session.pending_candidates.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut session.pending_candidates);
        tracing::debug!(
            "Replaying {} buffered ICE candidates for {}",
            pending.len(),
            session.peer()
        );

        let handle = self.require_handle(session)?;
        for candidate in pending {
            handle.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Lokale Medien holen, Handle erstellen und Tracks anhängen
    async fn prepare_handle(&self, session: &mut CallSession) -> Result<(), CallError> {
        if session.has_handle() {
            return Ok(());
        }

        let tracks = self.media.acquire_local_media(&self.constraints).await?;

        let sink = HandleEventSink::new(
            session.peer().clone(),
            session.attempt(),
            self.input_tx.clone(),
        );
        let handle = self.factory.create(session.peer(), sink).await?;

        // Ab hier gehört das Handle der Session und wird mit ihr freigegeben
        let handle = session.handle.insert(handle);
        for track in &tracks {
            handle.add_local_track(track).await?;
        }
        session.local_tracks = tracks;

        Ok(())
    }

    fn require_handle<'a>(
        &self,
        session: &'a mut CallSession,
    ) -> Result<&'a mut (dyn super::handle::NegotiationHandle + 'static), CallError> {
        let peer = session.peer().clone();
        let phase = session.phase();
        session
            .handle_mut()
            .ok_or(CallError::InvalidPhase { peer, phase })
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    fn attempt_id(&mut self) -> u64 {
        let id = self.next_attempt;
        self.next_attempt += 1;
        id
    }

    fn open_incoming(
        &mut self,
        from: &Identity,
        room: Option<String>,
        offer: Option<SessionDescription>,
    ) {
        let mut session = CallSession::new(
            from.clone(),
            Direction::Incoming,
            self.attempt_id(),
            room.clone(),
        );
        session.pending_offer = offer;

        tracing::info!("Incoming call from {}", from);
        transition(&self.event_tx, &mut session, CallPhase::IncomingPending);
        let _ = self.event_tx.send(CallEvent::IncomingCall {
            peer: from.clone(),
            room,
        });

        self.arm_timeout(&session);
        self.sessions.insert(from.clone(), session);
    }

    fn arm_timeout(&self, session: &CallSession) {
        let Some(timeout) = self.call_timeout else {
            return;
        };

        let tx = self.input_tx.clone();
        let peer = session.peer().clone();
        let attempt = session.attempt();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineInput::Timeout { peer, attempt });
        });
    }

    /// Ergebnis eines Schritts übernehmen: bei Erfolg lebt die Session weiter,
    /// bei Fehler wird sie geschlossen
    async fn settle(&mut self, session: CallSession, result: Result<(), CallError>) {
        match result {
            Ok(()) => {
                self.sessions.insert(session.peer().clone(), session);
            }
            Err(error) => {
                tracing::warn!("Call with {} failed: {}", session.peer(), error);
                self.finish(session, CloseReason::Failed(error)).await;
            }
        }
    }

    async fn close_peer(&mut self, peer: &Identity, reason: CloseReason) {
        match self.sessions.remove(peer) {
            Some(session) => self.finish(session, reason).await,
            None => tracing::debug!("No session with {} to close ({:?})", peer, reason),
        }
    }

    /// Schließt eine Session: Handle freigeben, Phase `Closed`, Event senden
    async fn finish(&self, mut session: CallSession, reason: CloseReason) {
        let released = session.release().await;
        transition(&self.event_tx, &mut session, CallPhase::Closed);

        let duration = Utc::now() - session.created_at();
        tracing::info!(
            "Call with {} closed ({:?}) after {}s, handle released: {}",
            session.peer(),
            reason,
            duration.num_seconds(),
            released
        );

        let _ = self.event_tx.send(CallEvent::Closed {
            peer: session.peer().clone(),
            reason,
        });
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    fn notify(&self, session: &CallSession, action: Action) -> Result<(), SendError> {
        let envelope = Envelope::directed(action, self.local.clone(), session.peer().clone())
            .with_room(session.room.clone());
        self.outbound.send(&envelope)
    }

    fn send_payload<T: Serialize>(
        &self,
        session: &CallSession,
        action: Action,
        payload: &T,
    ) -> Result<(), CallError> {
        let envelope = Envelope::directed(action, self.local.clone(), session.peer().clone())
            .with_room(session.room.clone())
            .with_message(payload)
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.outbound.send(&envelope)?;
        Ok(())
    }
}

/// Aktualisiert die Phase und sendet Event
fn transition(events: &broadcast::Sender<CallEvent>, session: &mut CallSession, phase: CallPhase) {
    if session.phase == phase {
        return;
    }

    tracing::debug!("Call {}: {} -> {}", session.peer, session.phase, phase);
    session.phase = phase;
    let _ = events.send(CallEvent::StateChanged {
        peer: session.peer.clone(),
        phase,
    });
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local", &self.local)
            .field("sessions", &self.sessions)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
