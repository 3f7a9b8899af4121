//! Message Types für Signaling-Protokoll
//!
//! Jede Nachricht über das Relay ist ein [`Envelope`] mit Action-Tag,
//! Absender, optionalem Empfänger/Raum und einem action-spezifischen Payload.
//!
//! ```json
//! { "action": "offer", "from": "<id>", "to": "<id>", "message": { "offer": { "type": "offer", "sdp": "..." } } }
//! ```

use crate::identity::Identity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Missing payload for '{action}'")]
    MissingPayload { action: String },

    #[error("Invalid payload for '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("Missing recipient for '{action}'")]
    MissingRecipient { action: String },
}

// ============================================================================
// ACTION TAGS
// ============================================================================

/// Action-Tag einer Nachricht
///
/// Unbekannte Tags werden nicht als Parse-Fehler behandelt, sondern landen in
/// [`Action::Unknown`], damit der Router sie loggen und verwerfen kann.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Login,
    Logout,
    JoinRoom,
    CreateRoom,
    LeaveRoom,
    ShareRooms,
    ShareClients,
    AddPeer,
    RemovePeer,
    Offer,
    Answer,
    IceCandidate,
    SessionDescription,
    IncomingCall,
    OutgoingCall,
    AcceptIncomingCall,
    DenyIncomingCall,
    CancelOutgoingCall,
    Message,
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Login => "login",
            Action::Logout => "logout",
            Action::JoinRoom => "join-room",
            Action::CreateRoom => "create-room",
            Action::LeaveRoom => "leave-room",
            Action::ShareRooms => "share-rooms",
            Action::ShareClients => "share-clients",
            Action::AddPeer => "add-peer",
            Action::RemovePeer => "remove-peer",
            Action::Offer => "offer",
            Action::Answer => "answer",
            Action::IceCandidate => "ice-candidate",
            Action::SessionDescription => "session-description",
            Action::IncomingCall => "incoming-call",
            Action::OutgoingCall => "outgoing-call",
            Action::AcceptIncomingCall => "accept-incoming-call",
            Action::DenyIncomingCall => "deny-incoming-call",
            Action::CancelOutgoingCall => "cancel-outgoing-call",
            Action::Message => "message",
            Action::Unknown(tag) => tag,
        }
    }

    /// Gerichtete Actions müssen ein `to` tragen
    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            Action::Offer
                | Action::Answer
                | Action::IceCandidate
                | Action::IncomingCall
                | Action::OutgoingCall
                | Action::AcceptIncomingCall
                | Action::DenyIncomingCall
                | Action::CancelOutgoingCall
        )
    }
}

impl From<String> for Action {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "login" => Action::Login,
            "logout" => Action::Logout,
            "join-room" => Action::JoinRoom,
            "create-room" => Action::CreateRoom,
            "leave-room" => Action::LeaveRoom,
            "share-rooms" => Action::ShareRooms,
            "share-clients" => Action::ShareClients,
            "add-peer" => Action::AddPeer,
            "remove-peer" => Action::RemovePeer,
            "offer" => Action::Offer,
            "answer" => Action::Answer,
            "ice-candidate" => Action::IceCandidate,
            "session-description" => Action::SessionDescription,
            "incoming-call" => Action::IncomingCall,
            // Ältere Clients schreiben "outcoming"
            "outgoing-call" | "outcoming-call" => Action::OutgoingCall,
            "accept-incoming-call" => Action::AcceptIncomingCall,
            "deny-incoming-call" => Action::DenyIncomingCall,
            "cancel-outgoing-call" | "cancel-outcoming-call" => Action::CancelOutgoingCall,
            "message" => Action::Message,
            _ => Action::Unknown(tag),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Unknown(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Eine einzelne Signaling-Nachricht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(alias = "method")]
    pub action: Action,
    pub from: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

impl Envelope {
    /// Nachricht ohne Empfänger (z.B. login/logout)
    pub fn broadcast(action: Action, from: Identity) -> Self {
        Self {
            action,
            from,
            to: None,
            room: None,
            message: None,
        }
    }

    /// Nachricht an einen bestimmten Peer
    pub fn directed(action: Action, from: Identity, to: Identity) -> Self {
        Self {
            action,
            from,
            to: Some(to),
            room: None,
            message: None,
        }
    }

    pub fn with_room(mut self, room: Option<String>) -> Self {
        self.room = room;
        self
    }

    /// Hängt einen typisierten Payload an
    pub fn with_message<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.message = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Parst ein Envelope aus einem Text-Frame
    pub fn from_json(text: &str) -> Result<Self, MalformedMessage> {
        serde_json::from_str(text).map_err(|e| MalformedMessage::InvalidEnvelope(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Liest den Payload als `T`
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, MalformedMessage> {
        let value = self
            .message
            .as_ref()
            .ok_or_else(|| MalformedMessage::MissingPayload {
                action: self.action.to_string(),
            })?;

        T::deserialize(value).map_err(|e| MalformedMessage::InvalidPayload {
            action: self.action.to_string(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// SESSION DESCRIPTION / ICE
// ============================================================================

/// Typ einer Session Description (wie `RTCSdpType` im Browser)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// SDP Session Description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (Browser-Format `RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Payload von `offer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer: SessionDescription,
}

/// Payload von `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: SessionDescription,
}

/// Payload von `ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Payload von `share-clients`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientsPayload {
    pub clients: Vec<String>,
}

// ============================================================================
// TESTS
// ============================================================================
