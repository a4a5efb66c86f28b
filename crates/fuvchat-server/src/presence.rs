//! Presence registry
//!
//! Tracks every live connection's session: its display name once registered
//! and its session key once the handshake succeeded. Display names are unique
//! case-insensitively. All operations are synchronous and take one short lock.

use fuvchat_core::validation::normalize_username;
use fuvchat_core::{ConnectionId, SessionKey, ValidationError};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Per-connection state, created on connect and dropped on disconnect
#[derive(Debug, Default)]
struct Session {
    display_name: Option<String>,
    key: Option<SessionKey>,
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    /// Registered names in registration order
    roster: Vec<(ConnectionId, String)>,
}

impl Registry {
    fn names(&self) -> Vec<String> {
        self.roster.iter().map(|(_, name)| name.clone()).collect()
    }
}

/// A registered user leaving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub display_name: String,
    pub roster: Vec<String>,
}

impl Departure {
    /// System notice announcing the departure
    pub fn notice(&self) -> String {
        format!("{} has left the chat.", self.display_name)
    }
}

/// Live connection to display-name mapping
#[derive(Debug)]
pub struct PresenceRegistry {
    inner: Mutex<Registry>,
    max_username_len: usize,
}

impl PresenceRegistry {
    pub fn new(max_username_len: usize) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            max_username_len,
        }
    }

    /// Create the session for a new connection
    pub fn open_session(&self, connection: &ConnectionId) {
        self.inner
            .lock()
            .sessions
            .entry(connection.clone())
            .or_default();
        debug!(conn = %connection, "Session opened");
    }

    /// Claim a display name; returns the full roster on success.
    ///
    /// Re-registering from the same connection renames it in place.
    pub fn register(
        &self,
        connection: &ConnectionId,
        raw_name: &str,
    ) -> Result<Vec<String>, ValidationError> {
        let name = normalize_username(raw_name, self.max_username_len)?;
        let folded = name.to_lowercase();

        let mut registry = self.inner.lock();
        let taken = registry
            .roster
            .iter()
            .any(|(owner, existing)| owner != connection && existing.to_lowercase() == folded);
        if taken {
            return Err(ValidationError::UsernameTaken { name });
        }

        match registry.roster.iter_mut().find(|(owner, _)| owner == connection) {
            Some(entry) => entry.1 = name.clone(),
            None => registry.roster.push((connection.clone(), name.clone())),
        }
        registry
            .sessions
            .entry(connection.clone())
            .or_default()
            .display_name = Some(name.clone());
        let roster = registry.names();
        drop(registry);

        info!(conn = %connection, username = %name, "User registered");
        Ok(roster)
    }

    /// Drop a connection's session and key; reports the departure if it had a name
    pub fn unregister(&self, connection: &ConnectionId) -> Option<Departure> {
        let mut registry = self.inner.lock();
        let session = registry.sessions.remove(connection);
        let position = registry
            .roster
            .iter()
            .position(|(owner, _)| owner == connection);
        let departed = position.map(|index| registry.roster.remove(index).1);
        let roster = registry.names();
        drop(registry);

        debug!(conn = %connection, had_session = session.is_some(), "Session closed");
        departed.map(|display_name| {
            info!(conn = %connection, username = %display_name, "User left");
            Departure {
                display_name,
                roster,
            }
        })
    }

    /// Exact, case-sensitive lookup of a registered name
    pub fn find(&self, display_name: &str) -> Option<ConnectionId> {
        self.inner
            .lock()
            .roster
            .iter()
            .find(|(_, name)| name == display_name)
            .map(|(connection, _)| connection.clone())
    }

    pub fn display_name(&self, connection: &ConnectionId) -> Option<String> {
        self.inner
            .lock()
            .sessions
            .get(connection)
            .and_then(|session| session.display_name.clone())
    }

    /// Snapshot of registered names in registration order
    pub fn roster(&self) -> Vec<String> {
        self.inner.lock().names()
    }

    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.inner.lock().sessions.contains_key(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Store the session key from a completed handshake
    pub fn install_key(&self, connection: &ConnectionId, key: SessionKey) {
        self.inner
            .lock()
            .sessions
            .entry(connection.clone())
            .or_default()
            .key = Some(key);
    }

    pub fn session_key(&self, connection: &ConnectionId) -> Option<SessionKey> {
        self.inner
            .lock()
            .sessions
            .get(connection)
            .and_then(|session| session.key.clone())
    }

    pub fn key_ready(&self, connection: &ConnectionId) -> bool {
        self.inner
            .lock()
            .sessions
            .get(connection)
            .is_some_and(|session| session.key.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_register_trims_and_returns_roster() {
        let registry = PresenceRegistry::new(50);
        registry.register(&conn("c1"), "  alice ").unwrap();
        let roster = registry.register(&conn("c2"), "bob").unwrap();
        assert_eq!(roster, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.find("alice"), Some(conn("c1")));
        assert_eq!(registry.display_name(&conn("c2")).as_deref(), Some("bob"));
    }

    #[test]
    fn test_case_insensitive_collision() {
        let registry = PresenceRegistry::new(50);
        registry.register(&conn("c1"), "Bob").unwrap();
        let err = registry.register(&conn("c2"), "bob").unwrap_err();
        assert!(err.to_string().contains("already taken"));
        assert_eq!(registry.roster(), vec!["Bob".to_string()]);
        assert!(registry.display_name(&conn("c2")).is_none());
    }

    #[test]
    fn test_find_is_case_sensitive() {
        let registry = PresenceRegistry::new(50);
        registry.register(&conn("c1"), "Bob").unwrap();
        assert!(registry.find("bob").is_none());
    }

    #[test]
    fn test_rename_on_same_connection() {
        let registry = PresenceRegistry::new(50);
        registry.register(&conn("c1"), "alice").unwrap();
        registry.register(&conn("c2"), "bob").unwrap();
        let roster = registry.register(&conn("c1"), "ALICE").unwrap();
        assert_eq!(roster, vec!["ALICE".to_string(), "bob".to_string()]);
        assert!(registry.find("alice").is_none());
    }

    #[test]
    fn test_unregister_drops_key_and_reports_departure() {
        let registry = PresenceRegistry::new(50);
        registry.open_session(&conn("c1"));
        registry.install_key(&conn("c1"), SessionKey::generate());
        registry.register(&conn("c1"), "alice").unwrap();
        registry.register(&conn("c2"), "bob").unwrap();
        assert!(registry.key_ready(&conn("c1")));

        let departure = registry.unregister(&conn("c1")).unwrap();
        assert_eq!(departure.display_name, "alice");
        assert_eq!(departure.roster, vec!["bob".to_string()]);
        assert_eq!(departure.notice(), "alice has left the chat.");
        assert!(registry.session_key(&conn("c1")).is_none());
        assert!(!registry.is_connected(&conn("c1")));
    }

    #[test]
    fn test_unregister_anonymous_connection() {
        let registry = PresenceRegistry::new(50);
        registry.open_session(&conn("c1"));
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.unregister(&conn("c1")).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_length_limit() {
        let registry = PresenceRegistry::new(5);
        assert_eq!(
            registry.register(&conn("c1"), "abcdef"),
            Err(ValidationError::UsernameTooLong { max: 5 })
        );
        assert_eq!(
            registry.register(&conn("c1"), "   "),
            Err(ValidationError::UsernameEmpty)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8, String),
        Unregister(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, prop::sample::select(vec!["bob", "Bob", "BOB", "alice", "Alice", "carol"]))
                .prop_map(|(c, name)| Op::Register(c, name.to_string())),
            (0u8..6).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn prop_folded_names_stay_unique(ops in proptest::collection::vec(op(), 1..60)) {
            let registry = PresenceRegistry::new(50);
            for op in ops {
                match op {
                    Op::Register(c, name) => {
                        let _ = registry.register(&conn(&c.to_string()), &name);
                    }
                    Op::Unregister(c) => {
                        registry.unregister(&conn(&c.to_string()));
                    }
                }
                let roster = registry.roster();
                let folded: HashSet<String> = roster.iter().map(|n| n.to_lowercase()).collect();
                prop_assert_eq!(folded.len(), roster.len());
            }
        }
    }
}
