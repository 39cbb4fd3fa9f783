//! # Tunnel Agent
//!
//! The private-network half of the reverse tunnel. The agent dials outbound
//! websocket connections to one or more relays, keeps a warm pool of them
//! per relay target, and executes the HTTP requests the relay forwards
//! through those connections against their destinations.
//!
//! ```text
//! relay ──WS──► [pool of tunnel connections] ──HTTP──► private services
//! ```
//!
//! ## Modules
//!
//! - [`config`]     — YAML configuration (identity, targets, pool sizes, secret)
//! - [`connection`] — one tunnel connection: dial, greeting, serve loop,
//!   keepalive
//! - [`pool`]       — per-target pool manager with the refill ticker
//! - [`client`]     — process aggregate owning one pool per target

pub mod client;
pub mod config;
pub mod connection;
pub mod pool;
