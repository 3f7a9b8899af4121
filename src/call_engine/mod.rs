//! Call Engine Module - Negotiation und Medien
//!
//! Dieses Modul verwaltet:
//! - Call Sessions pro Peer (Offer/Answer/ICE State Machine)
//! - Die Negotiation Handle Schnittstelle und deren WebRTC-Implementierung
//! - Lokale Medien (Mikrofon über cpal)

mod audio;
mod engine;
mod handle;
mod media;
mod peer_connection;
mod session;

pub use audio::{CpalMediaCapture, SAMPLE_RATE};
pub use engine::{CallEngine, CallError, CallEvent, CloseReason, MAX_PENDING_CANDIDATES};
pub use handle::{
    ConnectionState, EngineInput, HandleEvent, HandleEventKind, HandleEventSink, HandleFactory,
    NegotiationError, NegotiationHandle,
};
pub use media::{
    AudioConstraints, DeviceError, LocalTrack, MediaCapture, MediaConstraints, RemoteTrack,
    TrackKind, VideoConstraints,
};
pub use peer_connection::{default_ice_servers, WebRtcHandle, WebRtcHandleFactory};
pub use session::{CallPhase, CallSession, Direction};
