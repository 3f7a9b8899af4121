//! Client Konfiguration
//!
//! Wird aus Umgebungsvariablen geladen:
//!
//! | Variable | Default |
//! |---|---|
//! | `SIGNALING_URL` | `ws://localhost:8080` (sonst `BACKEND_HOST:BACKEND_PORT`) |
//! | `ICE_SERVERS` | `stun:stun.l.google.com:19302` (kommagetrennt) |
//! | `CALL_TIMEOUT_SECS` | `30` (`0` = kein Timeout) |
//! | `KEEPALIVE_SECS` | `25` |
//! | `ENABLE_VIDEO` | aus |
//! | `REQUIRE_KNOWN_PEERS` | an |

use crate::call_engine::{default_ice_servers, MediaConstraints};
use std::env;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

const DEFAULT_KEEPALIVE_SECS: u64 = 25;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Adresse des Signaling-Relays
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub call_timeout: Option<Duration>,
    /// Intervall der WebSocket Pings
    pub keepalive: Duration,
    pub enable_video: bool,
    /// Anrufe von Peers außerhalb des Rosters verwerfen
    pub require_known_peers: bool,
}

impl ClientConfig {
    /// Lädt die Konfiguration aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let signaling_url = match lookup("SIGNALING_URL") {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => match (lookup("BACKEND_HOST"), lookup("BACKEND_PORT")) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                _ => defaults.signaling_url,
            },
        };

        let ice_servers = match lookup("ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.ice_servers,
        };

        let call_timeout = match parse_secs(&lookup, "CALL_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.call_timeout,
        };

        // Mindestens eine Sekunde
        let keepalive = parse_secs(&lookup, "KEEPALIVE_SECS")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.keepalive);

        let enable_video = parse_flag(&lookup, "ENABLE_VIDEO")?.unwrap_or(defaults.enable_video);
        let require_known_peers = parse_flag(&lookup, "REQUIRE_KNOWN_PEERS")?
            .unwrap_or(defaults.require_known_peers);

        Ok(Self {
            signaling_url,
            ice_servers,
            call_timeout,
            keepalive,
            enable_video,
            require_known_peers,
        })
    }

    /// Medien die pro Anruf angefordert werden
    pub fn media_constraints(&self) -> MediaConstraints {
        if self.enable_video {
            MediaConstraints::default()
        } else {
            MediaConstraints::audio_only()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            call_timeout: Some(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            enable_video: false,
            require_known_peers: true,
        }
    }
}

fn parse_secs<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value })
        })
        .transpose()
}

fn parse_flag<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        })
        .transpose()
}

// ============================================================================
// TESTS
// ============================================================================
