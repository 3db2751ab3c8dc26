//! Server lifecycle
//!
//! `GameServer` owns the acceptor and the tick scheduler and is the only
//! place they are wired together. There are no process-wide singletons:
//! everything a component needs is handed to it here.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::game::{DataSaver, EventHook, MessageHandler, World};
use crate::scheduler::{SchedulerOptions, TickScheduler};
use crate::server::{Server, ServerError};

/// Called once, after everything else has stopped.
pub type TermFunc = Box<dyn FnOnce() + Send + 'static>;

/// Signals that end the process gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// `request_shutdown` was called from inside the process.
    Requested,
}

/// The game content plugged into the core.
#[derive(Clone)]
pub struct GameHooks {
    pub handler: Arc<dyn MessageHandler>,
    pub world: Arc<dyn World>,
    pub events: Arc<dyn EventHook>,
    pub saver: Arc<dyn DataSaver>,
}

pub struct GameServer {
    server: Server,
    scheduler: TickScheduler,
    shutdown_tx: watch::Sender<bool>,
    term_funcs: Mutex<Vec<TermFunc>>,
}

impl GameServer {
    pub fn new(config: ServerConfig, hooks: GameHooks) -> Result<Self, ServerError> {
        let scheduler = TickScheduler::new(
            SchedulerOptions::from_config(&config),
            hooks.world,
            hooks.events,
            hooks.saver,
        );
        let server = Server::new(config, hooks.handler)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            server,
            scheduler,
            shutdown_tx,
            term_funcs: Mutex::new(Vec::new()),
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    /// Binds the listener, then starts ticking. A bind failure leaves the
    /// scheduler stopped.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let addr = self.server.start().await?;
        self.scheduler.start();
        Ok(addr)
    }

    pub fn set_term_func<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.term_funcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(func));
    }

    /// Wakes `run_until_signal` as if a signal had arrived.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Waits for SIGINT, SIGTERM or `request_shutdown`, then shuts down.
    pub async fn run_until_signal(&self) -> anyhow::Result<Signal> {
        let mut requested = self.shutdown_tx.subscribe();
        let signal = tokio::select! {
            s = wait_for_signal() => s?,
            _ = requested.wait_for(|r| *r) => Signal::Requested,
        };
        tracing::info!("[core] shutdown signal: {:?}", signal);
        self.shutdown().await;
        Ok(signal)
    }

    /// Closes every session, runs one last autosave and stops ticking.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        self.server.shutdown().await;

        if self.scheduler.is_running() {
            self.scheduler.request_autosave();
            self.scheduler.stop().await;
        }

        let funcs = std::mem::take(
            &mut *self
                .term_funcs
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for func in funcs {
            func();
        }
        tracing::info!("[core] shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => { r?; Ok(Signal::Interrupt) }
        _ = term.recv() => Ok(Signal::Terminate),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Player;
    use crate::network::Frame;
    use crate::session::Session;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Stub {
        globals: AtomicUsize,
    }

    impl MessageHandler for Stub {
        fn on_message(&self, _session: &Arc<Session>, _frame: Frame) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl World for Stub {
        fn update(&self, _delta: Duration) -> anyhow::Result<()> {
            Ok(())
        }

        fn players(&self) -> Vec<Arc<dyn Player>> {
            Vec::new()
        }
    }

    impl EventHook for Stub {
        fn update(&self, _now: chrono::DateTime<chrono::Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl DataSaver for Stub {
        fn save_player_data(&self, _player: &dyn Player) -> anyhow::Result<()> {
            Ok(())
        }

        fn save_global_data(&self) -> anyhow::Result<()> {
            self.globals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn game_server() -> (GameServer, Arc<Stub>) {
        let stub = Arc::new(Stub::default());
        let hooks = GameHooks {
            handler: stub.clone(),
            world: stub.clone(),
            events: stub.clone(),
            saver: stub.clone(),
        };
        let config = ServerConfig {
            listen_ip: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        (GameServer::new(config, hooks).unwrap(), stub)
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (game, stub) = game_server();
        game.start().await.unwrap();
        assert!(game.server().is_running());
        assert!(game.scheduler().is_running());

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        game.set_term_func(move || flag.store(true, Ordering::SeqCst));

        game.shutdown().await;
        assert!(!game.server().is_running());
        assert!(!game.scheduler().is_running());
        assert!(called.load(Ordering::SeqCst));
        // final autosave
        assert_eq!(stub.globals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requested_shutdown_ends_run() {
        let (game, _) = game_server();
        game.start().await.unwrap();
        assert!(!game.shutdown_requested());

        game.request_shutdown();
        let signal = tokio::time::timeout(Duration::from_secs(10), game.run_until_signal())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, Signal::Requested);
        assert!(game.shutdown_requested());
        assert!(!game.server().is_running());
    }
}
