//! TCP acceptor
//!
//! One accept task admits connections (deny list first, then the per-address
//! cap) and hands each one to a bounded pool of startup workers that build,
//! register and start the session. A reaper task closes idle sessions once a
//! second.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ServerConfig;
use crate::game::MessageHandler;
use crate::network::acl::AccessList;
use crate::network::Frame;
use crate::session::{Session, SessionManager, SessionOptions};

const REAP_INTERVAL: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("server has been shut down")]
    ShutDown,
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub running: bool,
    pub port: u16,
    pub active_sessions: usize,
    pub unique_addresses: usize,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
}

/// Everything the accept task needs, cloned once per start.
#[derive(Clone)]
struct Acceptor {
    options: SessionOptions,
    acl: Arc<AccessList>,
    manager: Arc<SessionManager>,
    handler: Arc<dyn MessageHandler>,
    workers: usize,
    drain_timeout: Duration,
}

pub struct Server {
    config: ServerConfig,
    acceptor: Acceptor,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        let acl = config.access_list().map_err(ServerError::Config)?;

        let acceptor = Acceptor {
            options: SessionOptions::from_config(&config),
            acl: Arc::new(acl),
            manager: Arc::new(SessionManager::from_config(&config)),
            handler,
            workers: config.worker_count().max(1),
            drain_timeout: config.shutdown_timeout(),
        };

        Ok(Self {
            config,
            acceptor,
            running: Mutex::new(None),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.acceptor.manager
    }

    /// Binds the listener and starts accepting. Calling it again while
    /// running logs a warning and returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr() {
            tracing::warn!("[server] already running on {}", addr);
            return Ok(addr);
        }
        if self.acceptor.manager.is_shut_down() {
            return Err(ServerError::ShutDown);
        }

        let addr = self.config.bind_addr().map_err(ServerError::Config)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let mut running = self.running();
        if let Some(existing) = running.as_ref() {
            tracing::warn!("[server] already running on {}", existing.local_addr);
            return Ok(existing.local_addr);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(
            self.acceptor
                .clone()
                .accept_loop(listener, shutdown_rx.clone()),
        );
        let reaper_task = tokio::spawn(reap_idle(
            Arc::clone(&self.acceptor.manager),
            shutdown_rx,
        ));

        *running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
            reaper_task,
        });

        tracing::info!(
            "[server] [ready] addr={} workers={}",
            local_addr,
            self.acceptor.workers
        );
        Ok(local_addr)
    }

    /// Stops accepting, closes every session and drains the startup pool.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            self.acceptor.manager.shutdown();
            return;
        };
        tracing::info!("[server] shutting down addr={}", running.local_addr);

        running.shutdown_tx.send_replace(true);
        running.reaper_task.abort();

        let mut accept_task = running.accept_task;
        let limit = self.acceptor.drain_timeout + Duration::from_millis(500);
        if tokio::time::timeout(limit, &mut accept_task).await.is_err() {
            tracing::warn!("[server] accept task did not stop in {:?}, aborting", limit);
            accept_task.abort();
        }

        self.acceptor.manager.shutdown();
        tracing::info!("[server] stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    pub fn stats(&self) -> ServerStats {
        let local = self.local_addr();
        ServerStats {
            running: local.is_some(),
            port: local.map_or(self.config.port, |a| a.port()),
            active_sessions: self.acceptor.manager.session_count(),
            unique_addresses: self.acceptor.manager.unique_address_count(),
        }
    }

    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.acceptor.manager.broadcast(frame)
    }
}

impl Acceptor {
    async fn accept_loop(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        let mut pool: JoinSet<()> = JoinSet::new();

        loop {
            while pool.try_join_next().is_some() {}

            if pool.len() >= self.workers {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    _ = pool.join_next() => continue,
                }
            }

            let accepted = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                r = listener.accept() => r,
            };

            let (stream, addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("[server] accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if !self.admit(addr) {
                drop(stream);
                continue;
            }

            let worker = self.clone();
            pool.spawn(async move { worker.start_session(stream, addr) });
        }

        drop(listener);
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while pool.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("[server] startup workers still busy, aborting {}", pool.len());
            pool.abort_all();
        }
    }

    fn admit(&self, addr: SocketAddr) -> bool {
        let ip = addr.ip();
        if self.acl.is_denied(ip) {
            tracing::info!("[server] connection denied addr={}", addr);
            return false;
        }
        if self.manager.is_address_limit_reached(ip) {
            tracing::info!("[server] too many connections addr={}", addr);
            return false;
        }
        true
    }

    fn start_session(&self, stream: TcpStream, addr: SocketAddr) {
        let session = Session::new(
            stream,
            addr,
            self.options.clone(),
            Arc::downgrade(&self.manager),
        );
        if !self.manager.register(&session) {
            session.close();
            return;
        }
        tracing::info!("[server] connection accepted id={} addr={}", session.id(), addr);
        session.start(Arc::clone(&self.handler));
    }
}

async fn reap_idle(manager: Arc<SessionManager>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = interval.tick() => {
                let closed = manager.close_idle();
                if closed > 0 {
                    tracing::debug!("[server] reaped {} idle sessions", closed);
                }
            }
        }
    }
}
