//! Call Negotiation Session
//!
//! Eine Session pro Peer und Verbindungsversuch. Die Session besitzt das
//! Negotiation Handle exklusiv und gibt es beim Schließen genau einmal frei.

use super::handle::NegotiationHandle;
use super::media::{LocalTrack, RemoteTrack};
use crate::identity::Identity;
use crate::signaling::{IceCandidate, SessionDescription};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;

// ============================================================================
// CALL PHASE
// ============================================================================

/// Position einer Session im Negotiation-Ablauf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Idle,
    /// Einladung gesendet, warten auf accept/deny
    OutgoingPending,
    /// Einladung erhalten, warten auf lokale Entscheidung
    IncomingPending,
    OfferSent,
    AnswerSent,
    Negotiating,
    Connected,
    Closed,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::OutgoingPending => "outgoing-pending",
            CallPhase::IncomingPending => "incoming-pending",
            CallPhase::OfferSent => "offer-sent",
            CallPhase::AnswerSent => "answer-sent",
            CallPhase::Negotiating => "negotiating",
            CallPhase::Connected => "connected",
            CallPhase::Closed => "closed",
        }
    }

    /// Handle existiert und SDP-Austausch läuft
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            CallPhase::Negotiating | CallPhase::OfferSent | CallPhase::AnswerSent
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wer den Anruf gestartet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    pub(crate) peer: Identity,
    pub(crate) direction: Direction,
    pub(crate) attempt: u64,
    pub(crate) room: Option<String>,
    pub(crate) phase: CallPhase,
    pub(crate) local_description_set: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    /// Offer das mit der Einladung kam und auf accept wartet
    pub(crate) pending_offer: Option<SessionDescription>,
    pub(crate) handle: Option<Box<dyn NegotiationHandle>>,
    pub(crate) local_tracks: Vec<LocalTrack>,
    pub(crate) remote_tracks: Vec<RemoteTrack>,
    pub(crate) created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(peer: Identity, direction: Direction, attempt: u64, room: Option<String>) -> Self {
        Self {
            peer,
            direction,
            attempt,
            room,
            phase: CallPhase::Idle,
            local_description_set: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            pending_offer: None,
            handle: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending_candidates.iter()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut (dyn NegotiationHandle + 'static)> {
        self.handle.as_deref_mut()
    }

    /// Gibt Handle, lokale Tracks und gepufferte Candidates frei
    ///
    /// Gibt `true` zurück wenn ein Handle geschlossen wurde.
    pub(crate) async fn release(&mut self) -> bool {
        self.pending_candidates.clear();
        self.pending_offer = None;
        self.local_tracks.clear();

        match self.handle.take() {
            Some(mut handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("attempt", &self.attempt)
            .field("phase", &self.phase)
            .field("local_description_set", &self.local_description_set)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}
