//! High-level ClawChat server API.
//!
//! `ClawServer` owns the public UDP socket, the artifact lifecycle, one
//! session at a time, and the relay gateway. Everything runs on a single
//! cooperative task:
//!
//! - IDLE: publish a fresh artifact on the regeneration interval and
//!   answer the first authenticated HANDSHAKE_PUNCH.
//! - ESTABLISHED: destroy the artifact (secrets are single-use), relay
//!   application frames to the backend, run keepalive/rotation timers,
//!   optionally rotate the public port.
//! - On closure, return to IDLE; the compromise path re-publishes a
//!   fresh artifact immediately.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

use crate::core::{
    ClawError, CompromiseReason, ErrorCode, ProtocolConfig, PUNCH_INTERVAL, SHARED_SECRET_SIZE,
    SessionError,
};
use crate::crypto::Role;
use crate::relay::{RelayConfig, RelayGateway};
use crate::rendezvous::ArtifactStore;
use crate::session::{
    CloseCause, HandshakeResponder, Session, SessionEvent, SessionOutput, SessionPhase,
};
use crate::transport::ClawSocket;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the public UDP socket.
    pub bind_addr: IpAddr,
    /// Fixed public port, or `None` for an ephemeral one.
    pub bind_port: Option<u16>,
    /// Address written into the artifact (defaults to `bind_addr`; set
    /// this when binding a wildcard address).
    pub advertised_addr: Option<IpAddr>,
    /// Fixed path the artifact is published at.
    pub artifact_path: PathBuf,
    /// The long-lived bootstrap secret shared with the client operator.
    pub bootstrap_secret: [u8; SHARED_SECRET_SIZE],
    /// Optional operator-assigned server identifier for the artifact.
    pub server_id: Option<String>,
    /// Backend relay configuration.
    pub relay: RelayConfig,
    /// Protocol timing knobs.
    pub protocol: ProtocolConfig,
    /// Rebind the public port at this interval (`None` disables the
    /// automatic rotation; a command can still force one).
    pub port_rotation_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: None,
            advertised_addr: None,
            artifact_path: PathBuf::from(crate::core::DEFAULT_ARTIFACT_NAME),
            bootstrap_secret: [0u8; SHARED_SECRET_SIZE],
            server_id: None,
            relay: RelayConfig::default(),
            protocol: ProtocolConfig::default(),
            port_rotation_interval: None,
        }
    }
}

/// Builder for creating a `ClawServer`.
#[derive(Debug, Default)]
pub struct ClawServerBuilder {
    config: ServerConfig,
}

impl ClawServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the public bind address.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set a fixed public port.
    pub fn bind_port(mut self, port: u16) -> Self {
        self.config.bind_port = Some(port);
        self
    }

    /// Set the address advertised in the artifact.
    pub fn advertised_addr(mut self, addr: IpAddr) -> Self {
        self.config.advertised_addr = Some(addr);
        self
    }

    /// Set the artifact path.
    pub fn artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.artifact_path = path.into();
        self
    }

    /// Set the bootstrap secret.
    pub fn bootstrap_secret(mut self, secret: [u8; SHARED_SECRET_SIZE]) -> Self {
        self.config.bootstrap_secret = secret;
        self
    }

    /// Set the server identifier carried in the artifact.
    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.config.server_id = Some(id.into());
        self
    }

    /// Set the backend endpoint.
    pub fn backend_addr(mut self, addr: SocketAddr) -> Self {
        self.config.relay.backend_addr = addr;
        self
    }

    /// Override the protocol timing knobs.
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Enable automatic port rotation at the given interval.
    pub fn port_rotation_interval(mut self, interval: Duration) -> Self {
        self.config.port_rotation_interval = Some(interval);
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Events from the server loop.
#[derive(Debug)]
pub enum ServerEvent {
    /// A fresh artifact was written to the fixed path.
    ArtifactPublished {
        /// Its expiry time, seconds since the UNIX epoch.
        expires_at: u64,
    },
    /// A client completed the handshake.
    ClientConnected {
        /// The observed client endpoint.
        remote: SocketAddr,
    },
    /// The public socket moved to a new port.
    PortRotated {
        /// The new public endpoint.
        new_addr: SocketAddr,
    },
    /// A session-level event (rotation, compromise, closure, errors).
    Session(SessionEvent),
}

/// Commands accepted by the server loop.
enum Command {
    Shutdown,
    TriggerCompromise(CompromiseReason),
    RotateKeysNow,
    RotatePortNow,
}

/// Receiver for server events.
pub struct ServerEvents {
    rx: mpsc::Receiver<ServerEvent>,
}

impl ServerEvents {
    /// Receive the next server event. Returns `None` once the server
    /// loop has terminated.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// The initially bound public endpoint (port rotation moves it; see
    /// [`ServerEvent::PortRotated`]).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server loop, closing any active session.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    /// Declare the active session compromised.
    pub async fn trigger_compromise(&self, reason: CompromiseReason) {
        let _ = self.cmd_tx.send(Command::TriggerCompromise(reason)).await;
    }

    /// Force a key rotation proposal (no-op on the non-proposing side).
    pub async fn rotate_keys_now(&self) {
        let _ = self.cmd_tx.send(Command::RotateKeysNow).await;
    }

    /// Rebind the public socket to a fresh ephemeral port now.
    pub async fn rotate_port_now(&self) {
        let _ = self.cmd_tx.send(Command::RotatePortNow).await;
    }
}

/// The ClawChat server.
pub struct ClawServer;

impl ClawServer {
    /// Bind the public socket, connect the relay gateway, publish the
    /// first artifact, and start the server loop.
    ///
    /// Bind and gateway failures surface here so the process can exit
    /// with the right code before any artifact is written.
    pub async fn spawn(config: ServerConfig) -> Result<(ServerHandle, ServerEvents), ClawError> {
        let bind = SocketAddr::new(config.bind_addr, config.bind_port.unwrap_or(0));
        let socket = ClawSocket::bind(bind).await?;
        let local_addr = socket.local_addr()?;

        // The protocol-level backend budget governs the gateway.
        let mut relay_config = config.relay.clone();
        relay_config.reply_timeout = config.protocol.backend_timeout;
        let gateway = RelayGateway::new(&relay_config).await?;

        let advertised_ip = config.advertised_addr.unwrap_or(config.bind_addr);
        let store = Arc::new(ArtifactStore::new(
            config.artifact_path.clone(),
            config.bootstrap_secret,
            config.protocol.artifact_validity.as_secs(),
            config.protocol.artifact_regen.as_secs(),
            config.server_id.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(run_loop(
            socket,
            gateway,
            store,
            advertised_ip,
            config,
            cmd_rx,
            event_tx,
        ));

        Ok((
            ServerHandle { cmd_tx, local_addr },
            ServerEvents { rx: event_rx },
        ))
    }
}

/// Publish an artifact off the main loop (PBKDF2 is deliberately slow).
async fn publish_blocking(
    store: &Arc<ArtifactStore>,
    advertised: SocketAddr,
) -> Result<crate::rendezvous::RendezvousArtifact, ClawError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.publish(advertised))
        .await
        .map_err(|e| SessionError::Fatal(format!("artifact worker died: {e}")))?
        .map_err(ClawError::from)
}

/// Receive from the draining old socket if one exists, else never.
async fn recv_old(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// The server loop: single task, sole owner of socket, session, store,
/// and gateway.
async fn run_loop(
    mut socket: ClawSocket,
    mut gateway: RelayGateway,
    store: Arc<ArtifactStore>,
    advertised_ip: IpAddr,
    config: ServerConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    // Old socket kept through the port-rotation grace window.
    let mut old_socket: Option<(Arc<UdpSocket>, Instant)> = None;

    'lifecycle: loop {
        // ---------------- IDLE: publish artifacts, await the punch ----
        let advertised = match socket.local_addr() {
            Ok(addr) => SocketAddr::new(advertised_ip, addr.port()),
            Err(_) => break 'lifecycle,
        };
        let artifact = match publish_blocking(&store, advertised).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(error = %e, "cannot publish artifact; stopping");
                break 'lifecycle;
            }
        };
        let _ = event_tx
            .send(ServerEvent::ArtifactPublished {
                expires_at: artifact.expires_at,
            })
            .await;

        let mut responder = match HandshakeResponder::new(artifact.shared_secret()) {
            Ok(responder) => responder,
            Err(e) => {
                warn!(error = %e, "crypto init failed; stopping");
                break 'lifecycle;
            }
        };
        drop(artifact);

        let mut regen = interval(config.protocol.artifact_regen);
        regen.tick().await; // the immediate first tick
        let mut buf = [0u8; 2048];

        let handshake = loop {
            tokio::select! {
                received = socket.inner().recv_from(&mut buf) => {
                    let Ok((len, from)) = received else { break 'lifecycle };
                    match responder.handle_datagram(&buf[..len], from) {
                        Ok(Some((ack, result))) => {
                            if socket.send_to(&ack, from).await.is_err() {
                                break 'lifecycle;
                            }
                            break result;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "handshake crypto failure; stopping");
                            break 'lifecycle;
                        }
                    }
                }
                _ = regen.tick() => {
                    match publish_blocking(&store, advertised).await {
                        Ok(fresh) => {
                            let _ = event_tx
                                .send(ServerEvent::ArtifactPublished {
                                    expires_at: fresh.expires_at,
                                })
                                .await;
                            match HandshakeResponder::new(fresh.shared_secret()) {
                                Ok(fresh_responder) => responder = fresh_responder,
                                Err(_) => break 'lifecycle,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "artifact regeneration failed; stopping");
                            break 'lifecycle;
                        }
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break 'lifecycle,
                    // Session-scoped commands are meaningless while idle.
                    Some(_) => {}
                },
            }
        };

        // ------------- ESTABLISHED: relay until the session closes ----
        // The artifact (and its single-use secret) must not outlive the
        // handshake.
        if let Err(e) = store.destroy() {
            warn!(error = %e, "could not destroy artifact");
        }
        let remote = handshake.remote;
        let mut session = Session::establish(handshake, Role::Server, &config.protocol);
        let _ = event_tx.send(ServerEvent::ClientConnected { remote }).await;

        let mut tick = interval(PUNCH_INTERVAL);
        let mut port_rotation = config.port_rotation_interval.map(|period| {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer
        });
        let mut close_cause: Option<CloseCause> = None;
        let mut old_buf = [0u8; 2048];

        while session.phase() != SessionPhase::Closed {
            // Drop the drained old socket after grace.
            if let Some((_, deadline)) = &old_socket {
                if Instant::now() >= *deadline {
                    info!("old public socket drained; closing it");
                    old_socket = None;
                }
            }

            let mut rotate_port = false;
            let mut drop_old_socket = false;
            let output = tokio::select! {
                received = socket.inner().recv_from(&mut buf) => match received {
                    Ok((len, _)) => session.handle_datagram(&buf[..len]),
                    Err(_) => session.close(),
                },
                received = recv_old(old_socket.as_ref().map(|(s, _)| s.as_ref()), &mut old_buf) => {
                    // Identical processing for frames on the old socket.
                    match received {
                        Ok((len, _)) => session.handle_datagram(&old_buf[..len]),
                        Err(_) => {
                            drop_old_socket = true;
                            SessionOutput::default()
                        }
                    }
                },
                reply = gateway.recv_reply() => match reply {
                    Ok((message_type, payload)) => {
                        match session.send_application(message_type, &payload) {
                            Ok(frame) => SessionOutput {
                                datagrams: vec![frame],
                                events: Vec::new(),
                            },
                            Err(e) => {
                                debug!(error = %e, "dropping backend reply");
                                SessionOutput::default()
                            }
                        }
                    }
                    Err(_) => backend_unavailable(&mut session),
                },
                _ = tick.tick() => {
                    let mut output = session.on_tick();
                    if gateway.reply_timed_out() {
                        output.push(backend_unavailable(&mut session));
                    }
                    output
                }
                _ = async {
                    match port_rotation.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    rotate_port = true;
                    SessionOutput::default()
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        let output = session.close();
                        dispatch(&socket, &mut session, &mut gateway, &event_tx, output).await;
                        break 'lifecycle;
                    }
                    Some(Command::TriggerCompromise(reason)) => session.trigger_compromise(reason),
                    Some(Command::RotateKeysNow) => session.rotate_now(),
                    Some(Command::RotatePortNow) => {
                        rotate_port = true;
                        SessionOutput::default()
                    }
                },
            };

            if drop_old_socket {
                old_socket = None;
            }
            if let Some(cause) = dispatch(&socket, &mut session, &mut gateway, &event_tx, output).await {
                close_cause = Some(cause);
            }

            if rotate_port && session.phase() != SessionPhase::Closed {
                match rotate_public_port(&mut socket, &mut session, config.bind_addr, advertised_ip)
                    .await
                {
                    Ok((old, new_addr)) => {
                        old_socket =
                            Some((old, Instant::now() + config.protocol.grace_interval));
                        let _ = event_tx.send(ServerEvent::PortRotated { new_addr }).await;
                    }
                    Err(e) => warn!(error = %e, "port rotation failed; keeping current socket"),
                }
            }
        }

        // The compromise path replaces the artifact immediately; the
        // IDLE phase at the top of the loop publishes it.
        if close_cause == Some(CloseCause::Compromise) {
            info!("session closed by compromise; regenerating artifact");
        }
        old_socket = None;
    }

    let _ = store.destroy();
    info!("server loop stopped");
}

/// Seal a BACKEND_UNAVAILABLE error toward the peer; the session stays
/// open.
fn backend_unavailable(session: &mut Session) -> SessionOutput {
    warn!("backend unavailable; reporting to peer");
    match session.send_error(ErrorCode::BackendUnavailable, &[]) {
        Ok(frame) => SessionOutput {
            datagrams: vec![frame],
            events: Vec::new(),
        },
        Err(_) => SessionOutput::default(),
    }
}

/// Transmit datagrams, relay application events to the backend, forward
/// the rest to the owner. Returns the close cause if the session closed.
async fn dispatch(
    socket: &ClawSocket,
    session: &mut Session,
    gateway: &mut RelayGateway,
    event_tx: &mpsc::Sender<ServerEvent>,
    output: SessionOutput,
) -> Option<CloseCause> {
    let mut follow_up: Vec<Vec<u8>> = Vec::new();
    let mut closed = None;

    for datagram in &output.datagrams {
        if let Err(e) = socket.send_to(datagram, session.remote()).await {
            debug!(error = %e, "send failed");
        }
    }

    for event in output.events {
        match event {
            SessionEvent::Application {
                message_type,
                payload,
            } => {
                if gateway.forward(message_type, &payload).await.is_err() {
                    follow_up.extend(backend_unavailable(session).datagrams);
                }
            }
            SessionEvent::Closed { cause } => {
                closed = Some(cause);
                let _ = event_tx
                    .send(ServerEvent::Session(SessionEvent::Closed { cause }))
                    .await;
            }
            other => {
                let _ = event_tx.send(ServerEvent::Session(other)).await;
            }
        }
    }

    for datagram in follow_up {
        if let Err(e) = socket.send_to(&datagram, session.remote()).await {
            debug!(error = %e, "send failed");
        }
    }
    closed
}

/// Bind a fresh ephemeral socket, announce it, and swap it in. The old
/// socket is returned for its grace-window drain.
async fn rotate_public_port(
    socket: &mut ClawSocket,
    session: &mut Session,
    bind_addr: IpAddr,
    advertised_ip: IpAddr,
) -> Result<(Arc<UdpSocket>, SocketAddr), ClawError> {
    let fresh = ClawSocket::bind(SocketAddr::new(bind_addr, 0)).await?;
    let new_port = fresh.local_addr()?.port();
    let new_addr = SocketAddr::new(advertised_ip, new_port);

    // Announce on the old socket before the swap.
    let notify = session.announce_port_rotation(new_addr)?;
    socket.send_to(&notify, session.remote()).await?;

    let old = socket.socket_arc();
    *socket = fresh;
    info!(%new_addr, "public socket rotated");
    Ok((old, new_addr))
}
