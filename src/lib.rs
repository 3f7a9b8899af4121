//! PeerCall - P2P Video Call Client
//!
//! Ein Signaling-Client für P2P Anrufe mit:
//! - WebSocket-Relay für Signaling (login/logout, Einladungen, SDP, ICE)
//! - WebRTC für die eigentliche Medienverbindung
//! - Einer Negotiation State Machine pro Peer
//!
//! Es gibt keinen persistenten Zustand: Identität, Roster und Sessions leben
//! nur so lange wie der Prozess.

pub mod call_engine;
pub mod client;
pub mod config;
pub mod identity;
pub mod roster;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{CallError, CallEvent, CallPhase, CloseReason};
pub use client::{connect, connect_with, next_event, ClientError, ClientEvent, ClientHandle};
pub use config::ClientConfig;
pub use identity::Identity;

// ============================================================================
// LOGGING
// ============================================================================

/// Standard-Filter wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "peercall=debug,webrtc=warn";

/// Initialisiert Logging (mehrfacher Aufruf ist harmlos)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
