//! WebSocket Transport zum Signaling-Relay
//!
//! Verwaltet die persistente Verbindung zum Relay:
//! - Verbindungsaufbau und `Ready`-Event
//! - Serialisierte Ausgabe über einen Writer-Task
//! - Keepalive (WebSocket Pings)
//! - Eingehende Frames als Envelopes (oder `Malformed`) weiterleiten
//!
//! Keine automatische Reconnection, das entscheidet der Aufrufer.

use super::messages::{Envelope, MalformedMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Kapazität der Ausgangs-Queue
const OUTBOUND_CAPACITY: usize = 256;

/// Kapazität der Event-Queue zum Aufrufer
const INBOUND_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid relay address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("WebSocket connection failed: {0}")]
    Handshake(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

// ============================================================================
// TRANSPORT EVENTS / STATE
// ============================================================================

/// Events die vom Transport geliefert werden (in Empfangsreihenfolge)
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Verbindung offen, Login kann gesendet werden
    Ready,
    /// Gültiges Envelope empfangen
    Envelope(Envelope),
    /// Frame konnte nicht geparst werden (wird verworfen)
    Malformed(MalformedMessage),
    /// Verbindung verloren
    Disconnected { reason: Option<String> },
}

/// Beobachtbarer Verbindungsstatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Disconnected,
}

// ============================================================================
// ENVELOPE SINK
// ============================================================================

/// Ausgehende Seite des Transports, so wie die Call Engine sie sieht
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError>;
}

// ============================================================================
// TRANSPORT SESSION
// ============================================================================

/// Verbindung zum Signaling-Relay
pub struct TransportSession {
    address: String,
    state: Arc<RwLock<TransportState>>,
    tx: mpsc::Sender<Message>,
}

impl TransportSession {
    /// Verbindet mit dem Relay
    ///
    /// Liefert die Session und die Folge eingehender Events. Das erste Event
    /// ist immer [`TransportEvent::Ready`], das letzte
    /// [`TransportEvent::Disconnected`].
    pub async fn connect(
        address: &str,
        keepalive: Duration,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), ConnectionError> {
        let ws_url = normalize_address(address)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);
        let state = Arc::new(RwLock::new(TransportState::Open));

        // Ready vor allen anderen Events einreihen
        let _ = event_tx.send(TransportEvent::Ready).await;

        // Read-Task starten
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let mut reason = None;

            while let Some(msg_result) = read.next().await {
                let event = match msg_result {
                    Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                        Ok(envelope) => TransportEvent::Envelope(envelope),
                        Err(e) => TransportEvent::Malformed(e),
                    },
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => match Envelope::from_json(text) {
                            Ok(envelope) => TransportEvent::Envelope(envelope),
                            Err(e) => TransportEvent::Malformed(e),
                        },
                        Err(e) => TransportEvent::Malformed(MalformedMessage::InvalidEnvelope(
                            e.to_string(),
                        )),
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!("WebSocket closed by relay");
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                };

                if event_tx.send(event).await.is_err() {
                    tracing::debug!("Transport consumer dropped, stopping reader");
                    break;
                }
            }

            *state_clone.write() = TransportState::Disconnected;
            let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
        });

        // Write-Task mit Keepalive starten
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive.max(Duration::from_secs(1)));
            // Der erste Tick kommt sofort
            interval.tick().await;

            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = interval.tick() => Message::Ping(Vec::new()),
                };

                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    *state_clone.write() = TransportState::Disconnected;
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        Ok((
            Self {
                address: ws_url.to_string(),
                state,
                tx,
            },
            event_rx,
        ))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Sendet ein Envelope (non-blocking, verwendet try_send)
    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        let text = envelope
            .to_json()
            .map_err(|e| SendError::Encode(e.to_string()))?;

        tracing::trace!("-> {}", text);

        self.tx.try_send(Message::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Schließt die Verbindung
    pub fn close(&self) {
        if self.is_connected() {
            let _ = self.tx.try_send(Message::Close(None));
        }
        *self.state.write() = TransportState::Disconnected;
    }
}

impl EnvelopeSink for TransportSession {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        TransportSession::send(self, envelope)
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Prüft die Relay-Adresse und wandelt http(s) in ws(s) um
pub fn normalize_address(address: &str) -> Result<Url, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let mut url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };

    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot change scheme".to_string()))?;

    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::signaling::messages::Action;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn relay() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        (listener, address)
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("http://localhost:8080").unwrap().scheme(),
            "ws"
        );
        assert_eq!(
            normalize_address("https://relay.example.com").unwrap().scheme(),
            "wss"
        );
        assert!(matches!(
            normalize_address("ftp://relay"),
            Err(ConnectionError::InvalidAddress { .. })
        ));
        assert!(normalize_address("not an address").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, address) = relay().await;
        drop(listener);

        let result = TransportSession::connect(&address, Duration::from_secs(25)).await;
        assert!(matches!(result, Err(ConnectionError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_ready_envelopes_malformed_and_disconnect() {
        let (listener, address) = relay().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // Login vom Client lesen
            let login = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };

            ws.send(Message::Text(
                r#"{"action":"login","from":"bob"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("{broken".to_string())).await.unwrap();
            ws.send(Message::Text(
                r#"{"action":"logout","from":"bob"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            login
        });

        let (session, mut events) = TransportSession::connect(&address, Duration::from_secs(25))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Ready));
        assert!(session.is_connected());

        let me = Identity::new("alice").unwrap();
        session
            .send(&Envelope::broadcast(Action::Login, me))
            .unwrap();

        let bob = Identity::new("bob").unwrap();
        match events.recv().await {
            Some(TransportEvent::Envelope(envelope)) => {
                assert_eq!(envelope.action, Action::Login);
                assert_eq!(envelope.from, bob);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Malformed(_))
        ));
        match events.recv().await {
            Some(TransportEvent::Envelope(envelope)) => assert_eq!(envelope.action, Action::Logout),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));

        assert_eq!(session.state(), TransportState::Disconnected);
        assert_eq!(
            session.send(&Envelope::broadcast(
                Action::Logout,
                Identity::new("alice").unwrap()
            )),
            Err(SendError::NotConnected)
        );

        let login = server.await.unwrap();
        assert_eq!(login, r#"{"action":"login","from":"alice"}"#);
    }
}
