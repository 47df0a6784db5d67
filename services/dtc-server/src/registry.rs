//! Session registry
//!
//! Owns every live session. Other components hold session ids or short-lived
//! `Arc<Session>` copies taken under the registry lock. Lifecycle changes are
//! published on a broadcast channel so observers can react to connects and
//! disconnects without being wired into the server.
//!
//! Lock order: registry before session.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use protocol::SymbolId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::RegistryError;
use crate::session::{CloseReason, Session, SessionId};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum SessionEvent {
    Connected {
        session_id: SessionId,
        peer: SocketAddr,
    },
    Authenticated {
        session_id: SessionId,
        username: String,
    },
    /// Published exactly once per session.
    Disconnected {
        session_id: SessionId,
        reason: CloseReason,
    },
}

pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    closed_total: AtomicU64,
    max_clients: usize,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            closed_total: AtomicU64::new(0),
            max_clients,
            events,
        }
    }

    /// Admit a new session built by `build` under a fresh id.
    ///
    /// The capacity check and the insert happen under one write lock, and
    /// no id is consumed when the registry is full.
    pub fn insert_with(
        &self,
        build: impl FnOnce(SessionId) -> Session,
    ) -> Result<Arc<Session>, RegistryError> {
        let session = {
            let mut sessions = self.sessions.write();
            if sessions.len() >= self.max_clients {
                return Err(RegistryError::CapacityExceeded {
                    max_clients: self.max_clients,
                });
            }
            let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(build(id));
            sessions.insert(id, Arc::clone(&session));
            session
        };

        debug!(session_id = %session.id(), peer = %session.peer(), "Session registered");
        let _ = self.events.send(SessionEvent::Connected {
            session_id: session.id(),
            peer: session.peer(),
        });
        Ok(session)
    }

    /// Move a live session to Authenticated.
    ///
    /// Returns `false` if the session is gone or was already authenticated.
    pub fn authenticate(&self, session_id: SessionId, username: &str, now: Instant) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        if !session.authenticate(username, now) {
            return false;
        }
        let _ = self.events.send(SessionEvent::Authenticated {
            session_id,
            username: username.to_string(),
        });
        true
    }

    /// Remove a session, mark it closed and cancel its I/O.
    ///
    /// Returns `false` if the session was not in the registry.
    pub fn close(&self, session_id: SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.sessions.write().remove(&session_id) else {
            return false;
        };

        if session.mark_closed(reason.clone()) {
            self.closed_total.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %session_id, reason = %reason, "Session closed");
            let _ = self.events.send(SessionEvent::Disconnected { session_id, reason });
        }
        true
    }

    /// Close every live session with the same reason. Returns how many closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.close(*id, reason.clone()))
            .count()
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Sessions closed since the registry was created.
    pub fn closed_total(&self) -> u64 {
        self.closed_total.load(Ordering::Relaxed)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Snapshot of all live sessions in id order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_authenticated())
            .count()
    }

    /// Authenticated sessions subscribed to `symbol_id`, copied under the
    /// read lock.
    pub fn subscribers(&self, symbol_id: SymbolId) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.receives(symbol_id))
            .cloned()
            .collect()
    }

    /// Invoke `f` for every subscriber of `symbol_id`. The registry lock is
    /// released before `f` runs. Returns how many sessions were visited.
    pub fn for_each_subscriber(&self, symbol_id: SymbolId, mut f: impl FnMut(&Session)) -> usize {
        let targets = self.subscribers(symbol_id);
        for session in &targets {
            f(session);
        }
        targets.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
