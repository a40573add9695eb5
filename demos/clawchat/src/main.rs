//! ClawChat end-to-end demo.
//!
//! One binary, four modes, all driven by environment variables:
//!
//! - `CLAWCHAT_MODE=gensecret`: print a fresh bootstrap secret (hex).
//! - `CLAWCHAT_MODE=backend`: run a loopback demo backend that answers
//!   CHAT_REQUEST "ping" with CHAT_RESPONSE "pong" and echoes file/cron
//!   datagrams.
//! - `CLAWCHAT_MODE=server`: publish rendezvous artifacts, answer the
//!   hole punch, relay application traffic to the backend.
//! - `CLAWCHAT_MODE=client`: read the artifact, punch, then send stdin
//!   lines as chat requests (`/rotate`, `/compromise`, `/quit` for the
//!   sub-protocols).
//!
//! # Environment Variables
//!
//! - `CLAWCHAT_SECRET`: hex-encoded 32-byte bootstrap secret, or
//! - `CLAWCHAT_SECRET_FILE`: owner-readable file holding the secret
//! - `CLAWCHAT_ARTIFACT_PATH`: artifact path (default: ./clawchat-current.rdv)
//! - `CLAWCHAT_BIND_ADDR`: public bind address (default: 127.0.0.1)
//! - `CLAWCHAT_BIND_PORT`: fixed port or "ephemeral" (default)
//! - `CLAWCHAT_BACKEND_ADDR` / `CLAWCHAT_BACKEND_PORT`: backend endpoint
//!   (default: 127.0.0.1:55556)
//! - `CLAWCHAT_REFLECTORS`: comma-separated STUN reflectors (client)
//! - `CLAWCHAT_SERVER_ID`: identifier written into the artifact

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{error, info};

use clawchat_protocol::client::{ClawClient, ClawClientBuilder};
use clawchat_protocol::core::{
    BootstrapSecretSource, ClawError, CompromiseReason, DEFAULT_BACKEND_PORT, exit,
};
use clawchat_protocol::server::{ClawServer, ClawServerBuilder, ServerEvent};
use clawchat_protocol::session::SessionEvent;

/// Encode bytes as lowercase hex.
fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn secret_source() -> Option<BootstrapSecretSource> {
    if env::var("CLAWCHAT_SECRET").is_ok() {
        Some(BootstrapSecretSource::Env("CLAWCHAT_SECRET".into()))
    } else if let Ok(path) = env::var("CLAWCHAT_SECRET_FILE") {
        Some(BootstrapSecretSource::File(PathBuf::from(path)))
    } else {
        None
    }
}

fn backend_endpoint() -> Result<SocketAddr, String> {
    let addr = env_or("CLAWCHAT_BACKEND_ADDR", "127.0.0.1");
    let port = env_or("CLAWCHAT_BACKEND_PORT", &DEFAULT_BACKEND_PORT.to_string());
    format!("{addr}:{port}")
        .parse()
        .map_err(|e| format!("invalid backend endpoint: {e}"))
}

fn exit_code_for(error: &ClawError) -> u8 {
    match error {
        ClawError::Config(_) | ClawError::Artifact(_) => exit::BAD_CONFIG,
        ClawError::Io(_) => exit::BIND_FAILURE,
        ClawError::Crypto(_) => exit::CRYPTO_INIT_FAILURE,
        ClawError::Relay(_) => exit::BACKEND_UNREACHABLE,
        _ => exit::BAD_CONFIG,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mode = env_or("CLAWCHAT_MODE", "");
    let result = match mode.as_str() {
        "gensecret" => run_gensecret(),
        "backend" => run_backend().await,
        "server" => run_server().await,
        "client" => run_client().await,
        other => {
            eprintln!("CLAWCHAT_MODE must be gensecret, backend, server, or client (got {other:?})");
            return ExitCode::from(exit::BAD_CONFIG);
        }
    };

    match result {
        Ok(()) => ExitCode::from(exit::CLEAN),
        Err(code) => ExitCode::from(code),
    }
}

fn run_gensecret() -> Result<(), u8> {
    let secret = clawchat_protocol::crypto::random_bytes(32).map_err(|e| {
        error!(error = %e, "rng failure");
        exit::CRYPTO_INIT_FAILURE
    })?;
    println!("{}", encode_hex(&secret));
    Ok(())
}

/// A stand-in for the co-located AI/file/cron backends, unified behind
/// one loopback socket: chat pings become pongs, everything else echoes.
async fn run_backend() -> Result<(), u8> {
    let endpoint = backend_endpoint().map_err(|e| {
        error!("{e}");
        exit::BAD_CONFIG
    })?;
    let socket = UdpSocket::bind(endpoint).await.map_err(|e| {
        error!(error = %e, "backend bind failed");
        exit::BIND_FAILURE
    })?;
    info!(%endpoint, "demo backend listening");

    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!(error = %e, "backend socket error");
                return Err(exit::BIND_FAILURE);
            }
        };
        if len == 0 {
            continue;
        }
        let reply = match (buf[0], &buf[1..len]) {
            // CHAT_REQUEST "ping..." -> CHAT_RESPONSE "pong...".
            (0x20, payload) if payload.starts_with(b"ping") => {
                let mut r = vec![0x21];
                r.extend_from_slice(b"pong");
                r.extend_from_slice(&payload[4..]);
                r
            }
            // Other chat requests get a canned uppercase echo.
            (0x20, payload) => {
                let mut r = vec![0x21];
                r.extend_from_slice(payload.to_ascii_uppercase().as_slice());
                r
            }
            // File and cron kinds echo verbatim.
            _ => buf[..len].to_vec(),
        };
        if let Err(e) = socket.send_to(&reply, from).await {
            error!(error = %e, "backend send failed");
        }
    }
}

async fn run_server() -> Result<(), u8> {
    let Some(source) = secret_source() else {
        eprintln!("set CLAWCHAT_SECRET or CLAWCHAT_SECRET_FILE (try CLAWCHAT_MODE=gensecret)");
        return Err(exit::BAD_CONFIG);
    };
    let secret = source.load().map_err(|e| {
        error!(error = %e, "cannot load bootstrap secret");
        exit::BAD_CONFIG
    })?;

    let bind_addr: IpAddr = env_or("CLAWCHAT_BIND_ADDR", "127.0.0.1").parse().map_err(|_| {
        error!("invalid CLAWCHAT_BIND_ADDR");
        exit::BAD_CONFIG
    })?;
    let backend = backend_endpoint().map_err(|e| {
        error!("{e}");
        exit::BAD_CONFIG
    })?;

    let mut builder = ClawServerBuilder::new()
        .bind_addr(bind_addr)
        .artifact_path(env_or("CLAWCHAT_ARTIFACT_PATH", "clawchat-current.rdv"))
        .bootstrap_secret(secret)
        .backend_addr(backend);
    match env_or("CLAWCHAT_BIND_PORT", "ephemeral").as_str() {
        "ephemeral" => {}
        port => {
            let port = port.parse().map_err(|_| {
                error!("invalid CLAWCHAT_BIND_PORT");
                exit::BAD_CONFIG
            })?;
            builder = builder.bind_port(port);
        }
    }
    if let Ok(id) = env::var("CLAWCHAT_SERVER_ID") {
        builder = builder.server_id(id);
    }

    let (handle, mut events) = ClawServer::spawn(builder.build()).await.map_err(|e| {
        error!(error = %e, "server startup failed");
        exit_code_for(&e)
    })?;
    info!(addr = %handle.local_addr(), "server up; deliver the artifact out of band");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Some(ServerEvent::ArtifactPublished { expires_at }) => {
                    info!(expires_at, "artifact published");
                }
                Some(ServerEvent::ClientConnected { remote }) => {
                    info!(%remote, "client connected");
                }
                Some(ServerEvent::PortRotated { new_addr }) => {
                    info!(%new_addr, "public port rotated");
                }
                Some(ServerEvent::Session(event)) => {
                    info!(?event, "session event");
                }
                None => {
                    error!("server loop stopped");
                    return Err(exit::BIND_FAILURE);
                }
            },
        }
    }
}

async fn run_client() -> Result<(), u8> {
    let Some(source) = secret_source() else {
        eprintln!("set CLAWCHAT_SECRET or CLAWCHAT_SECRET_FILE");
        return Err(exit::BAD_CONFIG);
    };

    let mut builder = ClawClientBuilder::new()
        .artifact_path(env_or("CLAWCHAT_ARTIFACT_PATH", "clawchat-current.rdv"))
        .bootstrap_secret_source(&source)
        .map_err(|e| {
            error!(error = %e, "cannot load bootstrap secret");
            exit::BAD_CONFIG
        })?;
    if let Ok(reflectors) = env::var("CLAWCHAT_REFLECTORS") {
        for reflector in reflectors.split(',').filter(|s| !s.is_empty()) {
            let addr = reflector.trim().parse().map_err(|_| {
                error!("invalid reflector address {reflector:?}");
                exit::BAD_CONFIG
            })?;
            builder = builder.reflector(addr);
        }
    }

    let (client, mut events) = ClawClient::connect(builder.build()).await.map_err(|e| {
        error!(error = %e, "connect failed");
        exit_code_for(&e)
    })?;
    info!(remote = %client.remote(), "session established; type messages, /rotate, /compromise, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "" => {}
                    "/quit" => {
                        let _ = client.close().await;
                        return Ok(());
                    }
                    "/rotate" => {
                        let _ = client.rotate_now().await;
                    }
                    "/compromise" => {
                        let _ = client.trigger_compromise(CompromiseReason::Operator).await;
                    }
                    text => {
                        if client.send_chat(text.as_bytes().to_vec()).await.is_err() {
                            error!("session closed");
                            return Ok(());
                        }
                    }
                },
                Ok(None) | Err(_) => {
                    let _ = client.close().await;
                    return Ok(());
                }
            },
            event = events.recv() => match event {
                Some(SessionEvent::Application { message_type, payload }) => {
                    println!("<{message_type:?}> {}", String::from_utf8_lossy(&payload));
                }
                Some(SessionEvent::Closed { cause }) => {
                    info!(?cause, "session closed");
                    return Ok(());
                }
                Some(event) => info!(?event, "session event"),
                None => return Ok(()),
            },
        }
    }
}
