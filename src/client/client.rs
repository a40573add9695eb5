//! High-level ClawChat client API.
//!
//! `ClawClient` reads and decodes the rendezvous artifact, runs the NAT
//! rendezvous, then drives the established session on a background task.
//! The caller sends application payloads through the handle and consumes
//! [`SessionEvent`]s from the paired receiver.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::core::{
    BootstrapSecretSource, ClawError, CompromiseReason, ConfigError, NatError, ProtocolConfig,
    PUNCH_INTERVAL, SessionError, SHARED_SECRET_SIZE,
};
use crate::crypto::Role;
use crate::nat::{RendezvousConfig, rendezvous};
use crate::record::MessageType;
use crate::rendezvous::decode;
use crate::session::{Session, SessionEvent, SessionPhase};
use crate::transport::ClawSocket;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the delivered rendezvous artifact.
    pub artifact_path: PathBuf,
    /// The long-lived bootstrap secret shared with the server operator.
    pub bootstrap_secret: [u8; SHARED_SECRET_SIZE],
    /// Local address to bind the ephemeral UDP socket on.
    pub bind_addr: IpAddr,
    /// Optional STUN reflectors for public-endpoint discovery.
    pub reflectors: Vec<SocketAddr>,
    /// Protocol timing knobs.
    pub protocol: ProtocolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("clawchat-current.rdv"),
            bootstrap_secret: [0u8; SHARED_SECRET_SIZE],
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reflectors: Vec::new(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Builder for creating a `ClawClient`.
#[derive(Debug, Default)]
pub struct ClawClientBuilder {
    config: ClientConfig,
}

impl ClawClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the artifact path.
    pub fn artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.artifact_path = path.into();
        self
    }

    /// Set the bootstrap secret directly.
    pub fn bootstrap_secret(mut self, secret: [u8; SHARED_SECRET_SIZE]) -> Self {
        self.config.bootstrap_secret = secret;
        self
    }

    /// Load the bootstrap secret from an environment variable or file.
    pub fn bootstrap_secret_source(
        mut self,
        source: &BootstrapSecretSource,
    ) -> Result<Self, ConfigError> {
        self.config.bootstrap_secret = source.load()?;
        Ok(self)
    }

    /// Set the local bind address.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Add a STUN reflector.
    pub fn reflector(mut self, addr: SocketAddr) -> Self {
        self.config.reflectors.push(addr);
        self
    }

    /// Override the protocol timing knobs.
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Commands from the handle to the session loop.
enum Command {
    Send(MessageType, Vec<u8>),
    RotateNow,
    TriggerCompromise(CompromiseReason),
    Close,
}

/// Receiver for session events (application frames, rotations, errors,
/// closure).
#[derive(Debug)]
pub struct ClientEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl ClientEvents {
    /// Receive the next session event. Returns `None` once the session
    /// loop has terminated.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Wait for the next application frame, discarding other events.
    pub async fn recv_application(&mut self) -> Option<(MessageType, Vec<u8>)> {
        while let Some(event) = self.rx.recv().await {
            if let SessionEvent::Application {
                message_type,
                payload,
            } = event
            {
                return Some((message_type, payload));
            }
        }
        None
    }
}

/// A connected ClawChat client.
#[derive(Debug)]
pub struct ClawClient {
    cmd_tx: mpsc::Sender<Command>,
    remote: SocketAddr,
}

impl ClawClient {
    /// Read the artifact, run the rendezvous, and start the session.
    ///
    /// Surfaces [`crate::core::ArtifactError`] immediately for an
    /// unreadable, expired, or wrong-key artifact, and
    /// [`SessionError::HandshakeTimeout`] when no authenticated
    /// acknowledgment arrives within the handshake budget.
    pub async fn connect(config: ClientConfig) -> Result<(Self, ClientEvents), ClawError> {
        let blob = std::fs::read(&config.artifact_path)
            .map_err(crate::core::ArtifactError::from)?;
        let artifact = decode(&blob, &config.bootstrap_secret)?;
        info!(
            server = %artifact.server_addr,
            expires_at = artifact.expires_at,
            "loaded rendezvous artifact"
        );

        let nat_config = RendezvousConfig {
            bind_addr: config.bind_addr,
            reflectors: config.reflectors.clone(),
            handshake_timeout: config.protocol.handshake_timeout,
            ..Default::default()
        };
        let outcome = match rendezvous(&artifact, &nat_config).await {
            Ok(outcome) => outcome,
            Err(ClawError::Nat(NatError::NoResponse)) => {
                return Err(SessionError::HandshakeTimeout.into());
            }
            Err(e) => return Err(e),
        };

        let session = Session::establish(outcome.handshake, Role::Client, &config.protocol);
        let remote = session.remote();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(run_loop(outcome.socket, session, cmd_rx, event_tx));

        Ok((Self { cmd_tx, remote }, ClientEvents { rx: event_rx }))
    }

    /// The server endpoint the session was established with.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Send an application payload.
    pub async fn send(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Send(message_type, payload))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Send a chat request.
    pub async fn send_chat(&self, text: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        self.send(MessageType::ChatRequest, text.into()).await
    }

    /// Force a key rotation proposal (no-op on the non-proposing side).
    pub async fn rotate_now(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::RotateNow)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Declare the session compromised and tear it down fail-secure.
    pub async fn trigger_compromise(
        &self,
        reason: CompromiseReason,
    ) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::TriggerCompromise(reason))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Gracefully close the session.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Close)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// The client session loop: single task, cooperative, sole owner of the
/// session and its socket.
async fn run_loop(
    socket: ClawSocket,
    mut session: Session,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut tick = interval(PUNCH_INTERVAL);
    let mut buf = [0u8; 2048];

    loop {
        let output = tokio::select! {
            received = socket.inner().recv_from(&mut buf) => match received {
                Ok((len, _from)) => session.handle_datagram(&buf[..len]),
                Err(e) => {
                    debug!(error = %e, "socket error; closing session");
                    session.close()
                }
            },
            _ = tick.tick() => session.on_tick(),
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(message_type, payload)) => {
                    match session.send_application(message_type, &payload) {
                        Ok(frame) => crate::session::SessionOutput {
                            datagrams: vec![frame],
                            events: Vec::new(),
                        },
                        Err(e) => {
                            debug!(error = %e, "dropping outbound application frame");
                            crate::session::SessionOutput::default()
                        }
                    }
                }
                Some(Command::RotateNow) => session.rotate_now(),
                Some(Command::TriggerCompromise(reason)) => session.trigger_compromise(reason),
                Some(Command::Close) | None => session.close(),
            },
        };

        for datagram in &output.datagrams {
            if let Err(e) = socket.send_to(datagram, session.remote()).await {
                debug!(error = %e, "send failed");
            }
        }
        for event in output.events {
            let _ = event_tx.send(event).await;
        }

        if session.phase() == SessionPhase::Closed {
            break;
        }
    }
}
