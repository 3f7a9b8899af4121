//! Audio Capture - Mikrofon über cpal
//!
//! Prüft vor jedem Anruf ob ein passendes Eingabegerät existiert und liefert
//! den lokalen Audio-Track. Video wird von diesem Backend nicht aufgenommen.

use super::media::{
    AudioConstraints, DeviceError, LocalTrack, MediaCapture, MediaConstraints, TrackKind,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// CPAL MEDIA CAPTURE
// ============================================================================

/// [`MediaCapture`] für das Standard-Host-API von cpal
#[derive(Debug, Clone, Default)]
pub struct CpalMediaCapture;

impl CpalMediaCapture {
    pub fn new() -> Self {
        Self
    }

    /// Sucht das Eingabegerät und dessen beste Konfiguration
    fn probe(constraints: &AudioConstraints) -> Result<LocalTrack, DeviceError> {
        let host = cpal::default_host();

        let device = match &constraints.device_id {
            Some(name) => Self::find_input_device(&host, name)?,
            None => host
                .default_input_device()
                .ok_or(DeviceError::NoInputDevice)?,
        };

        let label = device.name().unwrap_or_else(|_| "unknown".to_string());
        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Using audio input '{}': {} Hz, {} channel(s)",
            label,
            config.sample_rate.0,
            config.channels
        );

        Ok(LocalTrack {
            id: format!("audio-{}", Uuid::new_v4()),
            kind: TrackKind::Audio,
            label,
        })
    }

    fn find_input_device(host: &cpal::Host, name: &str) -> Result<Device, DeviceError> {
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }

        Err(DeviceError::DeviceNotFound(name.to_string()))
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, DeviceError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

#[async_trait]
impl MediaCapture for CpalMediaCapture {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, DeviceError> {
        if constraints.is_empty() {
            return Err(DeviceError::NothingRequested);
        }
        if constraints.video.is_some() {
            return Err(DeviceError::UnsupportedKind(TrackKind::Video));
        }

        let Some(audio) = constraints.audio.clone() else {
            return Ok(Vec::new());
        };

        // Geräteabfrage blockiert, daher nicht auf dem Runtime-Thread
        let track = tokio::task::spawn_blocking(move || Self::probe(&audio))
            .await
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))??;

        Ok(vec![track])
    }
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, DeviceError> {
    // Priorität: 48kHz > andere, F32 > andere
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_max_sample_rate().into());
    }

    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(DeviceError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
