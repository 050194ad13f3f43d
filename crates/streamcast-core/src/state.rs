//! Mergeable server state.
//!
//! Gossip converges two pieces of state across the mesh: the username
//! directory and the activity log. Both merge with add-if-absent
//! semantics (a grow-only map union per key), which makes the merge
//! idempotent and commutative regardless of announce ordering.

use std::collections::{BTreeMap, HashMap};

/// Registered usernames and their secrets.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<String, String>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// True iff the username is registered with exactly this secret.
    pub fn verify(&self, username: &str, secret: &str) -> bool {
        self.users.get(username).is_some_and(|s| s == secret)
    }

    /// Insert a new record. Returns false (and leaves the existing
    /// record untouched) when the username is already taken.
    pub fn register(&mut self, username: impl Into<String>, secret: impl Into<String>) -> bool {
        let username = username.into();
        if self.users.contains_key(&username) {
            return false;
        }
        self.users.insert(username, secret.into());
        true
    }

    /// Union in a gossiped user list; existing records win.
    pub fn merge(&mut self, incoming: &HashMap<String, String>) {
        for (username, secret) in incoming {
            self.users
                .entry(username.clone())
                .or_insert_with(|| secret.clone());
        }
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Append-only log of serialized ACTIVITY_BROADCAST lines, keyed by
/// `username,millis-since-epoch`. Used for replay (REQUEST_ALL) and
/// gossip merge; entries are never mutated or removed.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: BTreeMap<String, String>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append under `key` unless the key is already present.
    pub fn record(&mut self, key: impl Into<String>, payload: impl Into<String>) {
        self.entries.entry(key.into()).or_insert_with(|| payload.into());
    }

    /// Union in a gossiped log; existing entries win.
    pub fn merge(&mut self, incoming: &BTreeMap<String, String>) {
        for (key, payload) in incoming {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| payload.clone());
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the log key for an activity accepted at `millis` (unix epoch
/// milliseconds). The original system keyed by wall-clock `hh:mm:ss`,
/// which collides across days; epoch milliseconds keep the same
/// `username,timestamp` shape without the collision.
pub fn activity_key(username: &str, millis: u128) -> String {
    format!("{username},{millis}")
}
