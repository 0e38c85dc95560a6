//! In-memory set of live sessions.
//!
//! Used for bookkeeping and inspection only; sessions never talk to each other
//! through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use opus_stream_types::SessionsResponse;
use tokio::sync::watch;
use uuid::Uuid;

use crate::session::Session;

/// Concurrency-safe registry of active sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    opened: AtomicU64,
    closed: AtomicU64,
    active: watch::Sender<usize>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            active: watch::Sender::new(0),
        }
    }

    /// Insert `session`. Returns `false` if a session with the same id exists.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session);
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.active.send_replace(sessions.len());
        true
    }

    /// Remove the session with `id`. Only the first call for an id returns it.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.lock();
        let removed = sessions.remove(id)?;
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.active.send_replace(sessions.len());
        Some(removed)
    }

    /// Register `session` and return a guard that removes it when dropped.
    pub fn register(self: &Arc<Self>, session: Arc<Session>) -> Option<Registration> {
        let id = session.id();
        if !self.add(session) {
            return None;
        }
        Some(Registration {
            registry: Arc::clone(self),
            id,
        })
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed_total(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Live sessions, oldest first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at());
        sessions
    }

    pub fn snapshot(&self) -> SessionsResponse {
        let sessions: Vec<_> = self.sessions().iter().map(|s| s.snapshot()).collect();
        SessionsResponse {
            active: sessions.len(),
            opened_total: self.opened_total(),
            closed_total: self.closed_total(),
            sessions,
        }
    }

    /// Resolve once no session is registered.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Keeps a session registered for as long as it is alive.
///
/// Dropping the guard deregisters the session, also on early returns and
/// panics in the owning task.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: Uuid,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(&self.id).is_some() {
            tracing::debug!(session_id = %self.id, "session deregistered");
        }
    }
}
