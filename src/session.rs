use crate::storage::{unix_now, DEFAULT_DB};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-client session state tracked for the lifetime of a connection
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u128,
    pub addr: Option<SocketAddr>,
    /// Name of the database this session is pinned to
    pub db: String,
    pub connected_at: i64,
    pub last_action: i64,
    /// Index of the I/O worker owning the socket
    pub worker: usize,
}

/// Registry of live sessions, keyed by 128-bit session id.
///
/// Ids compose the connection epoch with a process-wide counter; uniqueness
/// within the process is all the protocol needs.
pub struct SessionRegistry {
    sessions: DashMap<u128, Session>,
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_session_id() -> u128 {
    let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    (unix_now() as u128) << 64 | u128::from(seq)
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a freshly accepted connection, pinned to the default db
    pub fn register(&self, addr: Option<SocketAddr>, worker: usize) -> u128 {
        let now = unix_now();
        let id = next_session_id();
        self.sessions.insert(
            id,
            Session {
                id,
                addr,
                db: DEFAULT_DB.to_string(),
                connected_at: now,
                last_action: now,
                worker,
            },
        );
        id
    }

    pub fn unregister(&self, id: u128) {
        self.sessions.remove(&id);
    }

    /// Name of the database the session is pinned to; a session that has
    /// already been dismantled falls back to the default db.
    pub fn selected_db(&self, id: u128) -> String {
        self.sessions
            .get(&id)
            .map(|s| s.db.clone())
            .unwrap_or_else(|| DEFAULT_DB.to_string())
    }

    pub fn select_db(&self, id: u128, name: &str) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.db = name.to_string();
        }
    }

    /// Record protocol activity on the session
    pub fn touch(&self, id: u128) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_action = unix_now();
        }
    }

    pub fn get(&self, id: u128) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_pins_default_db() {
        let registry = SessionRegistry::new();
        let id = registry.register(None, 0);

        assert_eq!(registry.selected_db(id), DEFAULT_DB);
        assert_eq!(registry.count(), 1);

        registry.select_db(id, "scratch");
        assert_eq!(registry.selected_db(id), "scratch");

        registry.unregister(id);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.selected_db(id), DEFAULT_DB);
    }

    #[test]
    fn ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.register(None, 0);
        let b = registry.register(None, 1);
        assert_ne!(a, b);
    }
}
