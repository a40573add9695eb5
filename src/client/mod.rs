//! High-level ClawChat client API.

pub mod client;

pub use client::{ClawClient, ClawClientBuilder, ClientConfig, ClientEvents};
