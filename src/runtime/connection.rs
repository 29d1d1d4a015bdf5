//! Registry of live echo sessions.
//!
//! Each tracked session gets a slab slot whose key doubles as its poll token.
//! All access happens on the event loop thread, so there is no locking.

use crate::runtime::multiplexer::Multiplexer;
use crate::runtime::session::{CloseReason, EchoSession, SessionState, SessionStatus};
use mio::event::Source;
use mio::Token;
use slab::Slab;
use tracing::debug;

/// Registry of active sessions using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    sessions: Slab<EchoSession<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Track a newly spawned session and assign its id.
    ///
    /// Returns `None` if the registry is at capacity; the session is dropped,
    /// which closes its connection.
    pub fn track(&mut self, mut session: EchoSession<S>) -> Option<usize> {
        if self.sessions.len() >= self.max_connections {
            return None;
        }
        let entry = self.sessions.vacant_entry();
        let id = entry.key();
        session.id = id;
        entry.insert(session);
        Some(id)
    }

    /// Remove a session. Removing an unknown id returns `None`.
    pub fn untrack(&mut self, id: usize) -> Option<EchoSession<S>> {
        self.sessions.try_remove(id)
    }

    pub fn get(&self, id: usize) -> Option<&EchoSession<S>> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut EchoSession<S>> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.sessions.contains(id)
    }

    /// Ids of every tracked session, for shutdown enumeration.
    pub fn all(&self) -> Vec<usize> {
        self.sessions.iter().map(|(id, _)| id).collect()
    }

    /// Number of tracked sessions in `status`.
    pub fn count(&self, status: SessionStatus) -> usize {
        self.sessions
            .iter()
            .filter(|(_, s)| s.status() == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Maximum number of sessions allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut EchoSession<S>)> {
        self.sessions.iter_mut()
    }
}

impl<S: Source> ConnectionRegistry<S> {
    /// Untrack `id`, stop watching its stream, and close it.
    ///
    /// The stream is deregistered before the session is dropped, which is
    /// what closes the socket. Returns the reason the session closed with,
    /// which for an already closed session is its original reason.
    /// Releasing an id that is already gone is a no-op returning `None`.
    pub fn release(
        &mut self,
        id: usize,
        mux: &mut Multiplexer,
        reason: CloseReason,
    ) -> Option<CloseReason> {
        let mut session = self.untrack(id)?;

        if let Err(e) = mux.deregister(session.stream_mut(), Token(id)) {
            debug!(conn_id = id, error = %e, "Deregister failed");
        }

        if reason == CloseReason::Cancelled {
            session.cancel();
        } else {
            session.close(reason);
        }

        match session.state() {
            SessionState::Closed(reason) => Some(reason),
            _ => None,
        }
    }
}
