//! Presence tracking
//!
//! Best-effort record of which users are currently attached to a session,
//! kept independently of the pub/sub channel itself. Keys derive from the
//! session topic (`sc<session>`).

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

/// Per-session membership sets
pub struct PresenceStore {
    /// session key -> user ids
    members: DashMap<String, HashSet<i64>>,
}

/// Presence key for a session
pub fn session_key(session: i64) -> String {
    format!("sc{}", session)
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
        }
    }

    /// Record a user as attached. Returns true when the user was not
    /// already present.
    pub fn join(&self, session: i64, user: i64) -> bool {
        let joined = self
            .members
            .entry(session_key(session))
            .or_default()
            .insert(user);
        if joined {
            debug!(session, user, "presence joined");
        }
        joined
    }

    /// Drop a user's membership; empty sets are removed
    pub fn leave(&self, session: i64, user: i64) {
        let key = session_key(session);
        let emptied = match self.members.get_mut(&key) {
            Some(mut set) => {
                set.remove(&user);
                set.is_empty()
            }
            None => return,
        };

        if emptied {
            self.members.remove(&key);
        }
        debug!(session, user, "presence left");
    }

    /// Users currently attached to a session
    pub fn members(&self, session: i64) -> Vec<i64> {
        self.members
            .get(&session_key(session))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Attached user count for a session
    pub fn count(&self, session: i64) -> usize {
        self.members
            .get(&session_key(session))
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let presence = PresenceStore::new();
        assert!(presence.join(42, 7));
        assert!(!presence.join(42, 7));
        assert_eq!(presence.count(42), 1);
    }

    #[test]
    fn test_leave_removes_empty_sets() {
        let presence = PresenceStore::new();
        presence.join(42, 7);
        presence.join(42, 8);

        presence.leave(42, 7);
        assert_eq!(presence.count(42), 1);

        presence.leave(42, 8);
        assert_eq!(presence.count(42), 0);
        assert!(presence.members.is_empty());
    }

    #[test]
    fn test_leave_unknown_session_is_noop() {
        let presence = PresenceStore::new();
        presence.leave(42, 7);
        assert_eq!(presence.count(42), 0);
    }

    #[test]
    fn test_sessions_are_independent() {
        let presence = PresenceStore::new();
        presence.join(1, 7);
        presence.join(2, 7);

        presence.leave(1, 7);
        assert_eq!(presence.members(2), vec![7]);
    }
}
