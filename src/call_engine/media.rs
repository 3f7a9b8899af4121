//! Media Capture Schnittstelle
//!
//! Die Call Engine holt lokale Tracks über [`MediaCapture`], bevor ein
//! Negotiation Handle erstellt wird. Die eigentliche Aufnahme (Geräte,
//! Encoding) liegt außerhalb der Engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported media configuration: {0}")]
    UnsupportedConfig(String),

    #[error("{0} capture is not supported by this backend")]
    UnsupportedKind(TrackKind),

    #[error("No media requested")]
    NothingRequested,
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Lokaler Track der an ein Negotiation Handle gehängt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

/// Track den der Remote-Peer liefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Audio Constraints (Standardwerte wie im Browser-Client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            echo_cancellation: true,
            auto_gain_control: true,
            noise_suppression: true,
        }
    }
}

/// Video Constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            width: 1920,
            height: 1080,
            frame_rate: 60,
        }
    }
}

/// Welche Medien für einen Anruf angefordert werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

// ============================================================================
// MEDIA CAPTURE
// ============================================================================

/// Liefert lokale Tracks für einen Anruf
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, DeviceError>;
}
