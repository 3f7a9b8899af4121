//! Negotiation Handle Schnittstelle
//!
//! Ein Handle repräsentiert genau einen Verbindungsversuch mit einem Peer
//! (ICE + SDP). Die Engine spricht nur über diese Traits mit der
//! WebRTC-Implementierung, Tests verwenden ein Fake.
//!
//! Ereignisse des Handles (ICE Candidate erzeugt, Remote Track, Verbindungs-
//! status) gehen nicht über Callbacks direkt in die Engine, sondern werden
//! über den [`HandleEventSink`] in die Event-Loop eingereiht.

use super::media::{LocalTrack, RemoteTrack};
use crate::identity::Identity;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Das Handle hat eine Operation abgelehnt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct NegotiationError {
    pub operation: &'static str,
    pub reason: String,
}

impl NegotiationError {
    pub fn new(operation: &'static str, reason: impl ToString) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// HANDLE EVENTS
// ============================================================================

/// Verbindungsstatus des Handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleEventKind {
    IceCandidateGenerated(IceCandidate),
    RemoteTrackAdded(RemoteTrack),
    ConnectionStateChanged(ConnectionState),
}

/// Event eines Handles, adressiert über Peer und Versuchsnummer
#[derive(Debug, Clone, PartialEq)]
pub struct HandleEvent {
    pub peer: Identity,
    pub attempt: u64,
    pub kind: HandleEventKind,
}

/// Eingaben der Engine, die nicht vom Relay kommen
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Handle(HandleEvent),
    /// Timer für einen Versuch ist abgelaufen
    Timeout { peer: Identity, attempt: u64 },
}

/// Reiht Handle-Events in die Event-Loop ein
#[derive(Debug, Clone)]
pub struct HandleEventSink {
    peer: Identity,
    attempt: u64,
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl HandleEventSink {
    pub fn new(peer: Identity, attempt: u64, tx: mpsc::UnboundedSender<EngineInput>) -> Self {
        Self { peer, attempt, tx }
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn emit(&self, kind: HandleEventKind) {
        let event = HandleEvent {
            peer: self.peer.clone(),
            attempt: self.attempt,
            kind,
        };
        if self.tx.send(EngineInput::Handle(event)).is_err() {
            tracing::debug!("Event loop gone, dropping handle event for {}", self.peer);
        }
    }
}

// ============================================================================
// HANDLE TRAITS
// ============================================================================

/// Ein Verbindungsversuch (Peer Connection)
#[async_trait]
pub trait NegotiationHandle: Send + Sync {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Gibt alle Ressourcen frei. Wird genau einmal beim Schließen aufgerufen.
    async fn close(&mut self);
}

/// Erstellt pro Session ein neues Handle
#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn create(
        &self,
        peer: &Identity,
        events: HandleEventSink,
    ) -> Result<Box<dyn NegotiationHandle>, NegotiationError>;
}
