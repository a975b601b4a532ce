//! Session registry.

use crate::session::{Session, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Owns every live session on this node, keyed by id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_queue_size: usize,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions queue up to `max_queue_size`
    /// packets.
    #[must_use]
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_queue_size,
        }
    }

    /// Create and register a session with a fresh id.
    pub fn create(&self, local: bool) -> Arc<Session> {
        let session = Arc::new(Session::new(
            SessionId::generate(),
            local,
            self.max_queue_size,
        ));
        self.insert(session.clone());
        session
    }

    /// Register an existing session, replacing any with the same id.
    pub fn insert(&self, session: Arc<Session>) {
        debug!(session = %session.id(), local = session.is_local(), "Session registered");
        self.sessions.insert(session.id().clone(), session);
    }

    /// Look a session up by its wire id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Unregister a session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(session = %id, "Session unregistered");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A point-in-time copy of every registered session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
