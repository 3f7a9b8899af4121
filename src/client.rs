//! Call Client - Orchestrierung
//!
//! Besitzt Transport, Router, Roster und CallEngine und treibt alles aus
//! einer einzigen Event-Loop:
//! - Transport-Events (Envelopes in Empfangsreihenfolge)
//! - Handle-Events und Timer der CallEngine
//! - Befehle der UI über [`ClientHandle`]
//!
//! Jede Eingabe wird vollständig verarbeitet bevor die nächste gelesen wird.

use crate::call_engine::{
    CallEngine, CallError, CallEvent, CpalMediaCapture, EngineInput, HandleFactory, MediaCapture,
    WebRtcHandleFactory,
};
use crate::config::{ClientConfig, ConfigError};
use crate::identity::Identity;
use crate::roster::Roster;
use crate::signaling::{
    Action, ConnectionError, Dispatch, Envelope, MessageRouter, RouteError, TransportEvent,
    TransportSession,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::Instrument;

/// Kapazität der Befehls-Queue
const COMMAND_CAPACITY: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Client has been shut down")]
    Stopped,
}

// ============================================================================
// CLIENT EVENTS
// ============================================================================

/// Events für die UI (Calls laufen separat über [`CallEvent`])
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Ready,
    Disconnected { reason: Option<String> },
    RosterChanged(Vec<Identity>),
}

/// Nächstes Event eines Receivers, übersprungene Events werden nur geloggt
///
/// Gibt `None` zurück sobald der Client beendet ist.
pub async fn next_event<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event receiver lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Call {
        peer: Identity,
        room: Option<String>,
        reply: Reply<Result<(), CallError>>,
    },
    Accept {
        peer: Identity,
        reply: Reply<Result<(), CallError>>,
    },
    Deny {
        peer: Identity,
        reply: Reply<Result<(), CallError>>,
    },
    Hangup {
        peer: Identity,
        reply: Reply<Result<(), CallError>>,
    },
    Roster {
        reply: Reply<Vec<Identity>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

// ============================================================================
// CONNECT
// ============================================================================

/// Verbindet mit einem neuen Token, Mikrofon über cpal und WebRTC
pub async fn connect(config: ClientConfig) -> Result<ClientHandle, ClientError> {
    let factory = Arc::new(WebRtcHandleFactory::new(&config.ice_servers));
    connect_with(
        config,
        Identity::generate(),
        Arc::new(CpalMediaCapture::new()),
        factory,
    )
    .await
}

/// Verbindet mit eigener Identität und eigenen Medien-/Handle-Implementierungen
pub async fn connect_with(
    config: ClientConfig,
    identity: Identity,
    media: Arc<dyn MediaCapture>,
    factory: Arc<dyn HandleFactory>,
) -> Result<ClientHandle, ClientError> {
    let (transport, transport_rx) =
        TransportSession::connect(&config.signaling_url, config.keepalive).await?;
    let transport = Arc::new(transport);

    let (engine, engine_rx) = CallEngine::new(identity.clone(), transport.clone(), media, factory);
    let engine = engine
        .with_constraints(config.media_constraints())
        .with_call_timeout(config.call_timeout);

    let router =
        MessageRouter::new(identity.clone()).with_known_peers_required(config.require_known_peers);

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, _) = broadcast::channel(100);
    let calls = engine.event_sender();

    let event_loop = EventLoop {
        local: identity.clone(),
        transport,
        transport_rx,
        transport_open: true,
        engine,
        engine_rx,
        router,
        roster: Roster::new(identity.clone()),
        commands: command_rx,
        events: event_tx.clone(),
    };

    let span = tracing::info_span!("client", token = %identity);
    tokio::spawn(event_loop.run().instrument(span));

    tracing::info!("Client started as {}", identity);

    Ok(ClientHandle {
        identity,
        commands: command_tx,
        events: event_tx,
        calls,
    })
}

// ============================================================================
// CLIENT HANDLE
// ============================================================================

/// Schnittstelle für die UI
#[derive(Debug, Clone)]
pub struct ClientHandle {
    identity: Identity,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    calls: broadcast::Sender<CallEvent>,
}

impl ClientHandle {
    /// Eigene Identität (Token)
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    pub async fn initiate_call(&self, peer: &Identity) -> Result<(), ClientError> {
        let peer = peer.clone();
        self.request(|reply| Command::Call {
            peer,
            room: None,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn accept_incoming_call(&self, peer: &Identity) -> Result<(), ClientError> {
        let peer = peer.clone();
        self.request(|reply| Command::Accept { peer, reply })
            .await??;
        Ok(())
    }

    pub async fn deny_incoming_call(&self, peer: &Identity) -> Result<(), ClientError> {
        let peer = peer.clone();
        self.request(|reply| Command::Deny { peer, reply }).await??;
        Ok(())
    }

    pub async fn hangup(&self, peer: &Identity) -> Result<(), ClientError> {
        let peer = peer.clone();
        self.request(|reply| Command::Hangup { peer, reply })
            .await??;
        Ok(())
    }

    /// Snapshot der bekannten Peers
    pub async fn roster(&self) -> Result<Vec<Identity>, ClientError> {
        self.request(|reply| Command::Roster { reply }).await
    }

    /// Legt alle Anrufe auf, meldet ab und beendet die Event-Loop
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct EventLoop {
    local: Identity,
    transport: Arc<TransportSession>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    transport_open: bool,
    engine: CallEngine,
    engine_rx: mpsc::UnboundedReceiver<EngineInput>,
    router: MessageRouter,
    roster: Roster,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.transport_rx.recv(), if self.transport_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => self.on_disconnected(None).await,
                },
                Some(input) = self.engine_rx.recv() => {
                    self.engine.handle_input(input).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        // Alle Handles gedroppt
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        tracing::info!("Client event loop stopped");
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                tracing::info!("Connected to relay {}", self.transport.address());
                let login = Envelope::broadcast(Action::Login, self.local.clone());
                if let Err(e) = self.transport.send(&login) {
                    tracing::error!("Failed to send login: {}", e);
                }
                let _ = self.events.send(ClientEvent::Ready);
            }
            TransportEvent::Envelope(envelope) => self.on_envelope(envelope).await,
            TransportEvent::Malformed(e) => {
                tracing::warn!("Dropping malformed message: {}", e);
            }
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason).await,
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        let action = envelope.action.clone();
        let from = envelope.from.clone();

        match self
            .router
            .dispatch(envelope, &mut self.roster, &mut self.engine)
            .await
        {
            Ok(Dispatch::Roster(true)) => {
                let _ = self
                    .events
                    .send(ClientEvent::RosterChanged(self.roster.snapshot()));
            }
            Ok(_) => {}
            Err(RouteError::UnknownAction(tag)) => {
                tracing::warn!("Dropping message with unknown action '{}' from {}", tag, from);
            }
            Err(e @ RouteError::UnknownPeer(_)) => {
                tracing::warn!("Dropping {}: {}", action, e);
            }
            Err(RouteError::Malformed(e)) => {
                tracing::warn!("Dropping malformed {} from {}: {}", action, from, e);
            }
        }
    }

    async fn on_disconnected(&mut self, reason: Option<String>) {
        if !self.transport_open {
            return;
        }
        self.transport_open = false;

        tracing::warn!("Disconnected from relay: {:?}", reason);
        self.engine.on_transport_lost().await;
        let _ = self.events.send(ClientEvent::Disconnected { reason });
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Call { peer, room, reply } => {
                let result = if self.is_unknown_peer(&peer) {
                    Err(CallError::UnknownPeer(peer))
                } else {
                    self.engine.initiate_call(&peer, room).await
                };
                let _ = reply.send(result);
            }
            Command::Accept { peer, reply } => {
                let _ = reply.send(self.engine.accept_incoming_call(&peer).await);
            }
            Command::Deny { peer, reply } => {
                let _ = reply.send(self.engine.deny_incoming_call(&peer).await);
            }
            Command::Hangup { peer, reply } => {
                let _ = reply.send(self.engine.hangup(&peer).await);
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.roster.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Anrufe gehen nur an Peers im Roster
    fn is_unknown_peer(&self, peer: &Identity) -> bool {
        self.router.requires_known_peers() && *peer != self.local && !self.roster.contains(peer)
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down client");
        self.engine.hangup_all().await;

        if self.transport_open {
            let logout = Envelope::broadcast(Action::Logout, self.local.clone());
            if let Err(e) = self.transport.send(&logout) {
                tracing::debug!("Failed to send logout: {}", e);
            }
        }
        self.transport.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
