//! Hooks into game content
//!
//! The connection and tick machinery never looks inside the world. Content
//! plugs in through these traits: the tick loop drives [`World`] and
//! [`EventHook`], the autosave worker drives [`DataSaver`], and every decoded
//! frame goes to a [`MessageHandler`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::network::Frame;
use crate::session::Session;

/// Opaque identity bound to a session after login (account, character...).
pub type Principal = Arc<dyn Any + Send + Sync>;

/// Receives every inbound frame of every session.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called on the session's receive task, once per frame, in arrival
    /// order. An `Err` is logged and the session stays open.
    fn on_message(&self, session: &Arc<Session>, frame: Frame) -> Result<()>;

    /// Called once after the session's receive task has stopped.
    fn on_disconnect(&self, _session: &Arc<Session>) {}
}

/// A connected player as seen by the autosave pass.
pub trait Player: Send + Sync {
    fn id(&self) -> u64;

    /// Ephemeral players (bots, clones, test characters) are never saved.
    fn is_ephemeral(&self) -> bool {
        false
    }
}

pub trait World: Send + Sync + 'static {
    /// Advances the simulation by one nominal tick.
    fn update(&self, delta: Duration) -> Result<()>;

    /// Point-in-time copy of the online players.
    fn players(&self) -> Vec<Arc<dyn Player>>;
}

/// Timed world events (invasions, daily resets...).
pub trait EventHook: Send + Sync + 'static {
    fn update(&self, now: DateTime<Utc>) -> Result<()>;
}

/// Persistence backend used by autosave.
pub trait DataSaver: Send + Sync + 'static {
    fn save_player_data(&self, player: &dyn Player) -> Result<()>;

    fn save_global_data(&self) -> Result<()>;
}
