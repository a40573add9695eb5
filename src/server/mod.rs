//! High-level ClawChat server API.

pub mod server;

pub use server::{ClawServer, ClawServerBuilder, ServerConfig, ServerEvent, ServerEvents, ServerHandle};
