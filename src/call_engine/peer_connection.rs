//! WebRTC Negotiation Handle
//!
//! Implementiert [`NegotiationHandle`] mit einer `RTCPeerConnection`.
//! Callbacks der Peer Connection werden über den [`HandleEventSink`] in die
//! Event-Loop eingereiht.

use super::handle::{
    ConnectionState, HandleEventKind, HandleEventSink, HandleFactory, NegotiationError,
    NegotiationHandle,
};
use super::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::identity::Identity;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Stream-ID der lokalen Tracks
const STREAM_ID: &str = "peercall";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn rtc_ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }

    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

// ============================================================================
// HANDLE FACTORY
// ============================================================================

/// Erstellt pro Verbindungsversuch eine neue Peer Connection
#[derive(Debug, Clone)]
pub struct WebRtcHandleFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcHandleFactory {
    pub fn new(ice_servers: &[String]) -> Self {
        Self {
            ice_servers: rtc_ice_servers(ice_servers),
        }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::new("create", e))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::new("create", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| NegotiationError::new("create", e))?;

        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcHandleFactory {
    fn default() -> Self {
        Self::new(&default_ice_servers())
    }
}

#[async_trait]
impl HandleFactory for WebRtcHandleFactory {
    async fn create(
        &self,
        peer: &Identity,
        events: HandleEventSink,
    ) -> Result<Box<dyn NegotiationHandle>, NegotiationError> {
        let pc = self.create_peer_connection().await?;
        register_handlers(&pc, events);

        tracing::debug!("Created peer connection for {}", peer);
        Ok(Box::new(WebRtcHandle {
            pc,
            peer: peer.clone(),
            closed: false,
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &RTCPeerConnection, events: HandleEventSink) {
    // Connection State Handler
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection with {}: {:?}", sink.peer(), s);

        let state = match s {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        if let Some(state) = state {
            sink.emit(HandleEventKind::ConnectionStateChanged(state));
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    sink.emit(HandleEventKind::IceCandidateGenerated(from_rtc_candidate(init)))
                }
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler
    let sink = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        sink.emit(HandleEventKind::RemoteTrackAdded(RemoteTrack {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// HANDLE
// ============================================================================

pub struct WebRtcHandle {
    pc: Arc<RTCPeerConnection>,
    peer: Identity,
    closed: bool,
}

#[async_trait]
impl NegotiationHandle for WebRtcHandle {
    async fn add_local_track(&mut self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let codec = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let local = Arc::new(TrackLocalStaticRTP::new(
            codec,
            track.id.clone(),
            STREAM_ID.to_string(),
        ));

        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::new("add_track", e))?;

        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::new("create_offer", e))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::new("create_answer", e))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| NegotiationError::new("set_local_description", e))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::new("set_remote_description", e))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| NegotiationError::new("add_ice_candidate", e))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection with {}: {}", self.peer, e);
        }
    }
}

impl std::fmt::Debug for WebRtcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcHandle")
            .field("peer", &self.peer)
            .field("state", &self.pc.connection_state())
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let SessionDescription { kind, sdp } = description;
    let result = match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::new(
                "parse_description",
                "rollback is not supported",
            ))
        }
    };
    result.map_err(|e| NegotiationError::new("parse_description", e))
}

fn from_rtc_description(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::new(
                "parse_description",
                "unspecified description type",
            ))
        }
    };

    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::handle::EngineInput;
    use crate::testing::id;
    use tokio::sync::mpsc;

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };

        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(from_rtc_candidate(init), candidate);
    }

    #[test]
    fn test_rollback_is_rejected() {
        let rollback = SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        };

        let err = to_rtc_description(rollback).unwrap_err();
        assert_eq!(err.operation, "parse_description");
    }

    #[test]
    fn test_default_ice_servers() {
        let servers = rtc_ice_servers(&default_ice_servers());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(rtc_ice_servers(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_handle_creates_audio_offer() {
        let (tx, _rx) = mpsc::unbounded_channel::<EngineInput>();
        let factory = WebRtcHandleFactory::new(&[]);
        let peer = id("peer");

        let mut handle = factory
            .create(&peer, HandleEventSink::new(peer.clone(), 1, tx))
            .await
            .unwrap();

        handle
            .add_local_track(&LocalTrack {
                id: "audio-test".to_string(),
                kind: TrackKind::Audio,
                label: "test".to_string(),
            })
            .await
            .unwrap();

        let offer = handle.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        // SDP übersteht die Konvertierung
        let rtc = to_rtc_description(offer.clone()).unwrap();
        assert_eq!(rtc.sdp, offer.sdp);

        handle.close().await;
        handle.close().await;
    }
}
