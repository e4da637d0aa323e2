//! Process-wide map of live chat sessions, one per user.
//!
//! The registry is the only state shared between session tasks; every access
//! goes through the lock held by this value, which is constructed once at
//! startup and carried in the application state.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Identifies one live session occupying a user's registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: Uuid,
}

/// User → active-session map enforcing at most one live session per user.
///
/// Admitting a session for a user that already has one replaces the mapping
/// without closing the superseded session; its owning task notices on its
/// next transport write and unwinds then. `remove` is guarded by session id
/// so that late unwind cannot evict the replacement.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `handle` as the user's active session, returning the handle it
    /// superseded, if any.
    pub async fn admit(&self, user_id: Uuid, handle: SessionHandle) -> Option<SessionHandle> {
        let mut guard = self.sessions.write().await;
        let superseded = guard.insert(user_id, handle);
        metrics::gauge!("solace_active_sessions").set(guard.len() as f64);
        superseded
    }

    /// Removes the user's mapping if it still belongs to `session_id`.
    /// Returns whether anything was removed.
    pub async fn remove(&self, user_id: Uuid, session_id: Uuid) -> bool {
        let mut guard = self.sessions.write().await;
        let removed = match guard.get(&user_id) {
            Some(current) if current.session_id == session_id => {
                guard.remove(&user_id);
                true
            }
            _ => false,
        };
        metrics::gauge!("solace_active_sessions").set(guard.len() as f64);
        removed
    }

    /// The user's current session, if one is registered.
    pub async fn current(&self, user_id: Uuid) -> Option<SessionHandle> {
        let guard = self.sessions.read().await;
        guard.get(&user_id).copied()
    }
}
