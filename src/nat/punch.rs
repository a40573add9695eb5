//! The rendezvous engine: bind, probe, punch.
//!
//! Produces a bound UDP socket and a verified remote endpoint, or fails
//! with one of: local bind failure, no response. Symmetric-NAT detection
//! is advisory only: when two reflectors disagree on the mapped port the
//! outcome is flagged, but the punch is still attempted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::time::{Instant, interval, timeout_at};
use tracing::{debug, info, warn};

use crate::core::{ClawError, HANDSHAKE_TIMEOUT, NatError, PUNCH_INTERVAL};
use crate::rendezvous::RendezvousArtifact;
use crate::session::{HandshakeInitiator, HandshakeResult};
use crate::transport::ClawSocket;

use super::stun::query_mapped_address;

/// Knobs for one rendezvous attempt.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// Local address to bind the ephemeral socket on.
    pub bind_addr: IpAddr,
    /// Operator-supplied STUN reflectors (empty skips the probe).
    pub reflectors: Vec<SocketAddr>,
    /// Interval between HANDSHAKE_PUNCH transmissions.
    pub punch_interval: Duration,
    /// Total budget before giving up with no response.
    pub handshake_timeout: Duration,
    /// Per-reflector probe budget.
    pub probe_timeout: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reflectors: Vec::new(),
            punch_interval: PUNCH_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// A successful rendezvous.
#[derive(Debug)]
pub struct RendezvousOutcome {
    /// The bound socket the session will run on.
    pub socket: ClawSocket,
    /// The completed handshake (keys, ids, verified remote endpoint).
    pub handshake: HandshakeResult,
    /// Public mapping learned from the first answering reflector.
    pub public_endpoint: Option<SocketAddr>,
    /// Two reflectors disagreed on the mapped port.
    pub symmetric_nat_suspected: bool,
}

/// Run the rendezvous: bind an ephemeral socket, optionally probe the
/// reflectors, then punch toward the artifact's server endpoint until
/// the authenticated acknowledgment arrives.
pub async fn rendezvous(
    artifact: &RendezvousArtifact,
    config: &RendezvousConfig,
) -> Result<RendezvousOutcome, ClawError> {
    let socket = ClawSocket::bind_ephemeral(config.bind_addr)
        .await
        .map_err(NatError::LocalBindFail)?;
    debug!(local = %socket.local_addr()?, "bound rendezvous socket");

    let (public_endpoint, symmetric_nat_suspected) =
        probe_reflectors(&socket, &config.reflectors, config.probe_timeout).await;

    let now = crate::rendezvous::envelope::unix_now();
    let mut initiator = HandshakeInitiator::new(artifact.shared_secret(), now)
        .map_err(crate::core::SessionError::from)?;

    let target = artifact.server_addr;
    let deadline = Instant::now() + config.handshake_timeout;
    let mut punch_timer = interval(config.punch_interval);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = punch_timer.tick() => {
                let frame = initiator
                    .punch_frame()
                    .map_err(crate::core::SessionError::from)?;
                socket.send_to(&frame, target).await?;
            }
            received = timeout_at(deadline, socket.inner().recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, from))) => {
                        // First AEAD-verifying source wins; everything
                        // else is dropped.
                        if let Some(handshake) = initiator
                            .handle_datagram(&buf[..len], from)
                            .map_err(crate::core::SessionError::from)?
                        {
                            info!(remote = %handshake.remote, "hole punch succeeded");
                            return Ok(RendezvousOutcome {
                                socket,
                                handshake,
                                public_endpoint,
                                symmetric_nat_suspected,
                            });
                        }
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(NatError::NoResponse.into()),
                }
            }
        }
    }
}

/// Probe each reflector for this socket's public mapping.
///
/// Returns the first mapping plus whether two reflectors disagreed on
/// the mapped port (the likely-symmetric-NAT heuristic).
async fn probe_reflectors(
    socket: &ClawSocket,
    reflectors: &[SocketAddr],
    probe_timeout: Duration,
) -> (Option<SocketAddr>, bool) {
    let mut mappings = Vec::new();
    for &reflector in reflectors {
        if let Some(mapped) =
            query_mapped_address(socket.inner(), reflector, probe_timeout).await
        {
            debug!(%reflector, %mapped, "reflector answered");
            mappings.push(mapped);
        }
    }

    let suspected = mappings
        .windows(2)
        .any(|pair| pair[0].port() != pair[1].port());
    if suspected {
        warn!("reflectors disagree on mapped port: likely symmetric NAT, punching anyway");
    }
    (mappings.first().copied(), suspected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SHARED_SECRET_SIZE;
    use crate::session::HandshakeResponder;
    use tokio::net::UdpSocket;

    const SECRET: [u8; SHARED_SECRET_SIZE] = [0x22; SHARED_SECRET_SIZE];

    fn artifact_for(addr: SocketAddr) -> RendezvousArtifact {
        RendezvousArtifact::from_parts(addr, SECRET, 1000, 1600, 1600, None)
    }

    /// A one-shot server answering the first authenticated punch.
    async fn spawn_responder() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut responder = HandshakeResponder::new(&SECRET).unwrap();
            let mut buf = [0u8; 2048];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                if let Some((ack, _result)) =
                    responder.handle_datagram(&buf[..len], from).unwrap()
                {
                    socket.send_to(&ack, from).await.unwrap();
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_rendezvous_over_loopback() {
        let server_addr = spawn_responder().await;
        let artifact = artifact_for(server_addr);
        let config = RendezvousConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            punch_interval: Duration::from_millis(25),
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let outcome = rendezvous(&artifact, &config).await.unwrap();
        assert_eq!(outcome.handshake.remote, server_addr);
        assert!(!outcome.symmetric_nat_suspected);
        assert_eq!(outcome.public_endpoint, None);
    }

    #[tokio::test]
    async fn test_rendezvous_no_response() {
        // Nothing listens here.
        let artifact = artifact_for("127.0.0.1:1".parse().unwrap());
        let config = RendezvousConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            punch_interval: Duration::from_millis(25),
            handshake_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let err = rendezvous(&artifact, &config).await.unwrap_err();
        assert!(matches!(err, ClawError::Nat(NatError::NoResponse)));
    }

    #[tokio::test]
    async fn test_rendezvous_ignores_garbage_then_succeeds() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut responder = HandshakeResponder::new(&SECRET).unwrap();
            let mut buf = [0u8; 2048];
            let mut noise_sent = false;
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                if !noise_sent {
                    // Unauthenticated garbage first: the client must
                    // keep punching.
                    socket.send_to(b"not a frame", from).await.unwrap();
                    noise_sent = true;
                    continue;
                }
                if let Some((ack, _)) = responder.handle_datagram(&buf[..len], from).unwrap() {
                    socket.send_to(&ack, from).await.unwrap();
                    break;
                }
            }
        });

        let artifact = artifact_for(addr);
        let config = RendezvousConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            punch_interval: Duration::from_millis(25),
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let outcome = rendezvous(&artifact, &config).await.unwrap();
        assert_eq!(outcome.handshake.remote, addr);
    }

    #[tokio::test]
    async fn test_probe_disagreement_flags_symmetric_nat() {
        // Two reflectors that deliberately report different ports.
        async fn spawn_reflector(report_port: u16) -> SocketAddr {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                let mut transaction_id = [0u8; 12];
                transaction_id.copy_from_slice(&buf[8..20]);
                let mut mapped = from;
                mapped.set_port(report_port);
                let response =
                    crate::nat::stun::build_binding_response(&transaction_id, mapped);
                socket.send_to(&response, from).await.unwrap();
            });
            addr
        }

        let reflector_a = spawn_reflector(40_001).await;
        let reflector_b = spawn_reflector(40_002).await;

        let socket = ClawSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (mapped, suspected) = probe_reflectors(
            &socket,
            &[reflector_a, reflector_b],
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(mapped.unwrap().port(), 40_001);
        assert!(suspected);
    }
}
