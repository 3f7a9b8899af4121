//! Signaling Module - WebSocket Verbindung zum Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - WebSocket-Verbindung aufbauen und halten (Transport Session)
//! - Envelopes serialisieren und senden
//! - Eingehende Envelopes parsen und an Roster/CallEngine verteilen
//!

mod messages;
mod router;
mod transport;

pub use messages::*;
pub use router::{Dispatch, MessageRouter, RouteError};
pub use transport::{
    normalize_address, ConnectionError, EnvelopeSink, SendError, TransportEvent, TransportSession,
    TransportState,
};
