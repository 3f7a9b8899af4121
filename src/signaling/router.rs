//! Message Router
//!
//! Ordnet jedem Action-Tag einen Handler zu und verteilt eingehende
//! Envelopes an Roster oder CallEngine. Jede Envelope wird vollständig
//! verarbeitet bevor die nächste an die Reihe kommt, die Reihenfolge des
//! Transports bleibt also erhalten.

use super::messages::{
    Action, AnswerPayload, CandidatePayload, ClientsPayload, Envelope, MalformedMessage,
    OfferPayload, SdpType,
};
use crate::call_engine::CallEngine;
use crate::identity::Identity;
use crate::roster::Roster;
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Gründe warum eine Envelope verworfen wurde (nie fatal)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Message from unknown peer: {0}")]
    UnknownPeer(Identity),

    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
}

// ============================================================================
// ROUTES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    PeerLogin,
    PeerLogout,
    ShareClients,
    Invitation,
    Offer,
    Answer,
    Candidate,
    Accepted,
    Denied,
    Cancelled,
    PeerGone,
    /// Wird akzeptiert aber nur geloggt (Rooms, Chat)
    LogOnly,
}

impl Route {
    fn is_call(&self) -> bool {
        !matches!(
            self,
            Route::PeerLogin | Route::PeerLogout | Route::ShareClients | Route::LogOnly
        )
    }
}

/// Ergebnis eines `dispatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// An die CallEngine übergeben
    Call,
    /// Roster verarbeitet, `true` wenn er sich geändert hat
    Roster(bool),
    /// Angenommen aber ohne Wirkung (eigenes Echo, fremde Adresse, nur Log)
    Ignored,
}

// ============================================================================
// MESSAGE ROUTER
// ============================================================================

#[derive(Debug)]
pub struct MessageRouter {
    local: Identity,
    routes: HashMap<Action, Route>,
    require_known_peers: bool,
}

impl MessageRouter {
    pub fn new(local: Identity) -> Self {
        let routes = HashMap::from([
            (Action::Login, Route::PeerLogin),
            (Action::Logout, Route::PeerLogout),
            (Action::ShareClients, Route::ShareClients),
            (Action::IncomingCall, Route::Invitation),
            (Action::OutgoingCall, Route::Invitation),
            (Action::Offer, Route::Offer),
            (Action::Answer, Route::Answer),
            (Action::IceCandidate, Route::Candidate),
            (Action::AcceptIncomingCall, Route::Accepted),
            (Action::DenyIncomingCall, Route::Denied),
            (Action::CancelOutgoingCall, Route::Cancelled),
            (Action::RemovePeer, Route::PeerGone),
            (Action::Message, Route::LogOnly),
            (Action::JoinRoom, Route::LogOnly),
            (Action::CreateRoom, Route::LogOnly),
            (Action::LeaveRoom, Route::LogOnly),
            (Action::ShareRooms, Route::LogOnly),
            (Action::AddPeer, Route::LogOnly),
            (Action::SessionDescription, Route::LogOnly),
        ]);

        Self {
            local,
            routes,
            require_known_peers: true,
        }
    }

    /// Anrufe nur von Peers im Roster (oder mit laufender Session) annehmen
    pub fn with_known_peers_required(mut self, required: bool) -> Self {
        self.require_known_peers = required;
        self
    }

    pub fn requires_known_peers(&self) -> bool {
        self.require_known_peers
    }

    /// Verarbeitet eine Envelope vollständig
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        roster: &mut Roster,
        engine: &mut CallEngine,
    ) -> Result<Dispatch, RouteError> {
        let route = match self.routes.get(&envelope.action) {
            Some(route) => *route,
            None => {
                return Err(RouteError::UnknownAction(
                    envelope.action.as_str().to_string(),
                ))
            }
        };

        if envelope.from == self.local {
            tracing::debug!("Ignoring own {} echo", envelope.action.as_str());
            return Ok(Dispatch::Ignored);
        }

        match &envelope.to {
            Some(to) if *to != self.local => {
                tracing::debug!(
                    "Ignoring {} addressed to {}",
                    envelope.action.as_str(),
                    to
                );
                return Ok(Dispatch::Ignored);
            }
            None if envelope.action.is_directed() => {
                return Err(MalformedMessage::MissingRecipient {
                    action: envelope.action.as_str().to_string(),
                }
                .into());
            }
            _ => {}
        }

        let from = &envelope.from;

        if route.is_call()
            && self.require_known_peers
            && !roster.contains(from)
            && engine.session(from).is_none()
        {
            return Err(RouteError::UnknownPeer(from.clone()));
        }

        let room = envelope.room.clone();

        match route {
            Route::PeerLogin => Ok(Dispatch::Roster(roster.on_login(from))),
            Route::PeerLogout => {
                let changed = roster.on_logout(from);
                engine.on_peer_gone(from).await;
                Ok(Dispatch::Roster(changed))
            }
            Route::ShareClients => {
                let payload: ClientsPayload = envelope.payload()?;
                Ok(Dispatch::Roster(roster.replace(payload.clients)))
            }
            Route::Invitation => {
                engine.on_invitation(from, room).await;
                Ok(Dispatch::Call)
            }
            Route::Offer => {
                let payload: OfferPayload = envelope.payload()?;
                expect_kind(&envelope, payload.offer.kind, SdpType::Offer)?;
                engine.on_offer(from, room, payload.offer).await;
                Ok(Dispatch::Call)
            }
            Route::Answer => {
                let payload: AnswerPayload = envelope.payload()?;
                expect_kind(&envelope, payload.answer.kind, SdpType::Answer)?;
                engine.on_answer(from, payload.answer).await;
                Ok(Dispatch::Call)
            }
            Route::Candidate => {
                let payload: CandidatePayload = envelope.payload()?;
                engine.on_ice_candidate(from, payload.candidate).await;
                Ok(Dispatch::Call)
            }
            Route::Accepted => {
                engine.on_accepted(from).await;
                Ok(Dispatch::Call)
            }
            Route::Denied => {
                engine.on_denied(from).await;
                Ok(Dispatch::Call)
            }
            Route::Cancelled => {
                engine.on_cancelled(from).await;
                Ok(Dispatch::Call)
            }
            Route::PeerGone => {
                engine.on_peer_gone(from).await;
                Ok(Dispatch::Call)
            }
            Route::LogOnly => {
                tracing::debug!(
                    "Received {} from {} (room: {:?})",
                    envelope.action.as_str(),
                    from,
                    envelope.room
                );
                Ok(Dispatch::Ignored)
            }
        }
    }
}

fn expect_kind(envelope: &Envelope, actual: SdpType, expected: SdpType) -> Result<(), RouteError> {
    if actual == expected {
        return Ok(());
    }

    Err(MalformedMessage::InvalidPayload {
        action: envelope.action.as_str().to_string(),
        reason: format!("expected {} description, got {}", expected, actual),
    }
    .into())
}

// ============================================================================
// TESTS
// ============================================================================
