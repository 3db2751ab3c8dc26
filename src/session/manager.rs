//! Live session registry
//!
//! The registry and the per-address quota sit behind one lock so a session
//! is counted exactly while it is registered. Sessions are never closed while
//! that lock is held: `Session::close` calls back into `unregister`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::network::throttle::AddressQuota;
use crate::network::Frame;

use super::{Session, SessionId};

#[derive(Debug)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    quota: AddressQuota,
    shut_down: bool,
}

#[derive(Debug)]
pub struct SessionManager {
    inner: Mutex<Registry>,
    idle_timeout: Option<Duration>,
}

impl SessionManager {
    /// `max_per_address == 0` disables the per-address cap; `idle_timeout ==
    /// None` disables idle reaping.
    pub fn new(max_per_address: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Registry {
                sessions: HashMap::new(),
                quota: AddressQuota::new(max_per_address),
                shut_down: false,
            }),
            idle_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_per_address, config.idle_timeout())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a session and counts it against its source address. Returns false
    /// when the address is at its cap, the session is already closed or the
    /// manager has shut down; the caller is expected to close it.
    pub fn register(&self, session: &Arc<Session>) -> bool {
        let ip = session.remote_address().ip();
        let mut inner = self.lock();

        if inner.shut_down {
            tracing::info!("[session] register after shutdown refused id={}", session.id());
            return false;
        }
        if session.is_closed() || inner.sessions.contains_key(&session.id()) {
            return false;
        }
        if !inner.quota.try_acquire(ip) {
            tracing::info!(
                "[session] address limit reached ip={} max={}",
                ip,
                inner.quota.max_per_address()
            );
            return false;
        }

        inner.sessions.insert(session.id(), Arc::clone(session));
        tracing::debug!(
            "[session] registered id={} ip={} total={}",
            session.id(),
            ip,
            inner.sessions.len()
        );
        true
    }

    /// Removes a session. Safe to call more than once.
    pub fn unregister(&self, session: &Session) {
        let mut inner = self.lock();
        if inner.sessions.remove(&session.id()).is_some() {
            inner.quota.release(session.remote_address().ip());
            tracing::debug!(
                "[session] unregistered id={} total={}",
                session.id(),
                inner.sessions.len()
            );
        }
    }

    /// Early check used by the acceptor before a session is built.
    pub fn is_address_limit_reached(&self, ip: IpAddr) -> bool {
        self.lock().quota.is_full(ip)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().sessions.get(&id).cloned()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn unique_address_count(&self) -> usize {
        self.lock().quota.unique_addresses()
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.lock().quota.count(ip)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Queues `frame` on every registered session. Returns how many sessions
    /// it was handed to.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let sessions = self.sessions();
        for session in &sessions {
            session.send(frame.clone());
        }
        sessions.len()
    }

    /// Closes every session and refuses further registrations.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.lock();
            inner.shut_down = true;
            inner.quota.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };

        tracing::info!("[session] shutting down {} sessions", sessions.len());
        for session in sessions {
            session.close();
        }
    }

    /// Closes sessions with no inbound traffic for longer than the idle
    /// timeout. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let Some(limit) = self.idle_timeout else {
            return 0;
        };

        let idle: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|s| s.idle_for() > limit)
            .collect();

        for session in &idle {
            tracing::info!(
                "[session] idle timeout id={} addr={}",
                session.id(),
                session.remote_address()
            );
            session.close();
        }
        idle.len()
    }
}
