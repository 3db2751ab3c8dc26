//! Hearth - game server connection and simulation core
//!
//! Accepts TCP connections, negotiates a per-connection rolling XOR cipher,
//! frames the binary command protocol and drives a fixed-rate world tick with
//! periodic autosave. Game content plugs in through the traits in [`game`].

// ============================================
// Foundation
// ============================================

/// Server configuration (YAML)
pub mod config;
/// Framing, cipher, access control and address quotas
pub mod network;

// ============================================
// Runtime
// ============================================

/// Per-connection protocol state machine and the session registry
pub mod session;
/// TCP acceptor
pub mod server;
/// Fixed-rate tick loop and autosave
pub mod scheduler;
/// Lifecycle wiring and signal handling
pub mod core;

/// Hooks implemented by game content
pub mod game;

pub use crate::config::ServerConfig;
pub use crate::core::{GameHooks, GameServer};
