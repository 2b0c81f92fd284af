//! Session registry — durable, de-duplicated, named client sessions.
//!
//! Maps ephemeral client-supplied session ids to named records, optionally
//! bound to a terminal-multiplexer session. Tracks the single "active"
//! session that receives unaddressed inbound dispatch. The registry is a
//! plain value object; the watcher persists a [`RegistrySnapshot`] after
//! every mutation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::terminal::TerminalSession;

/// How a session entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// A client registered itself (explicitly or via auto-registration).
    Registered,
    /// Added by `rediscover_sessions` from a terminal snapshot.
    Discovered,
    /// A terminal binding observed without any client behind it.
    TerminalOnly,
}

/// One registered client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredSession {
    /// Opaque client-supplied key.
    pub session_id: String,
    /// Unique display name (numeric-suffix deduplicated at write time).
    pub name: String,
    /// External terminal-multiplexer id this session is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    /// How the entry was created.
    pub origin: SessionOrigin,
    /// When the entry was created.
    pub registered_at: DateTime<Utc>,
}

/// Persisted form of the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// All sessions, in no particular order.
    pub sessions: Vec<RegisteredSession>,
    /// The active session id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

/// In-memory session registry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, RegisteredSession>,
    active: Option<String>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a persisted snapshot.
    ///
    /// Reloaded terminal bindings are not yet trusted for dispatch — the
    /// caller re-checks liveness via `prune_dead` before relying on them.
    #[must_use]
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let sessions: HashMap<String, RegisteredSession> = snapshot
            .sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();
        let active = snapshot
            .active
            .filter(|id| sessions.contains_key(id));
        Self { sessions, active }
    }

    /// Export the registry for persistence.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut sessions: Vec<RegisteredSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        RegistrySnapshot {
            sessions,
            active: self.active.clone(),
        }
    }

    /// Register (or re-register) a session, returning the effective name.
    ///
    /// The proposed name is deduplicated with the lowest free numeric
    /// suffix ≥ 2, excluding the registering session itself so an unchanged
    /// re-registration is a no-op. Any pre-existing entry bound to the same
    /// terminal id is evicted first (last write wins); if the evicted entry
    /// was active, the registering session inherits active. The first
    /// registration becomes active when nothing else is.
    pub fn register(
        &mut self,
        session_id: &str,
        proposed_name: &str,
        terminal: Option<String>,
        origin: SessionOrigin,
    ) -> String {
        if let Some(ref term) = terminal {
            let stale: Vec<String> = self
                .sessions
                .values()
                .filter(|s| s.session_id != session_id && s.terminal.as_deref() == Some(term))
                .map(|s| s.session_id.clone())
                .collect();
            for id in stale {
                log::info!("[Registry] evicting {id} (terminal {term} re-bound)");
                self.sessions.remove(&id);
                if self.active.as_deref() == Some(id.as_str()) {
                    self.active = Some(session_id.to_string());
                }
            }
        }

        let name = self.dedup_name(proposed_name, session_id);
        match self.sessions.get_mut(session_id) {
            Some(existing) => {
                existing.name = name.clone();
                existing.terminal = terminal;
                existing.origin = origin;
            }
            None => {
                self.sessions.insert(
                    session_id.to_string(),
                    RegisteredSession {
                        session_id: session_id.to_string(),
                        name: name.clone(),
                        terminal,
                        origin,
                        registered_at: Utc::now(),
                    },
                );
            }
        }

        if self.active.is_none() {
            self.active = Some(session_id.to_string());
        }
        name
    }

    /// Rename a session, applying the same dedup rule.
    ///
    /// Returns the effective name, or `None` if the session is unknown.
    pub fn rename(&mut self, session_id: &str, new_name: &str) -> Option<String> {
        if !self.sessions.contains_key(session_id) {
            return None;
        }
        let name = self.dedup_name(new_name, session_id);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.name = name.clone();
        }
        Some(name)
    }

    /// Remove sessions whose terminal binding is absent from `live`.
    ///
    /// Entries without a terminal binding are never pruned here — they may
    /// still be valid abstract clients. Returns the removed session ids so
    /// the caller can drop their queues and waiters. Clears active if the
    /// active session was pruned.
    pub fn prune_dead(&mut self, live: &HashSet<String>) -> Vec<String> {
        let dead: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.terminal.as_ref().is_some_and(|t| !live.contains(t)))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &dead {
            self.sessions.remove(id);
            if self.active.as_deref() == Some(id.as_str()) {
                self.active = None;
            }
        }
        dead
    }

    /// Add entries for terminal sessions not already tracked.
    ///
    /// Names come from the terminal labels, deduplicated against the
    /// current registry. Returns the session ids of the added entries.
    pub fn discover(&mut self, snapshot: &[TerminalSession]) -> Vec<String> {
        let bound: HashSet<String> = self
            .sessions
            .values()
            .filter_map(|s| s.terminal.clone())
            .collect();
        let mut added = Vec::new();
        for term in snapshot {
            if bound.contains(&term.id) {
                continue;
            }
            let session_id = uuid::Uuid::new_v4().to_string();
            let name = self.dedup_name(&term.label, &session_id);
            self.sessions.insert(
                session_id.clone(),
                RegisteredSession {
                    session_id: session_id.clone(),
                    name,
                    terminal: Some(term.id.clone()),
                    origin: SessionOrigin::Discovered,
                    registered_at: Utc::now(),
                },
            );
            added.push(session_id);
        }
        added
    }

    /// Make the given session the active delivery target.
    ///
    /// Accepts a session id or a unique name. Returns `false` when no
    /// session matches.
    pub fn switch(&mut self, target: &str) -> bool {
        let id = self.resolve(target);
        match id {
            Some(id) => {
                self.active = Some(id);
                true
            }
            None => false,
        }
    }

    /// Remove a session entirely. Clears active if it was active.
    pub fn end(&mut self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed && self.active.as_deref() == Some(session_id) {
            self.active = None;
        }
        removed
    }

    /// Resolve a session id or unique name to a session id.
    #[must_use]
    pub fn resolve(&self, target: &str) -> Option<String> {
        if self.sessions.contains_key(target) {
            return Some(target.to_string());
        }
        self.sessions
            .values()
            .find(|s| s.name == target)
            .map(|s| s.session_id.clone())
    }

    /// The active session id, if any.
    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&RegisteredSession> {
        self.sessions.get(session_id)
    }

    /// Whether a session id is registered.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// All sessions, ordered by registration time.
    #[must_use]
    pub fn list(&self) -> Vec<&RegisteredSession> {
        let mut sessions: Vec<&RegisteredSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        sessions
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lowest-free-suffix name deduplication, excluding `exclude_id`.
    fn dedup_name(&self, proposed: &str, exclude_id: &str) -> String {
        let taken: HashSet<&str> = self
            .sessions
            .values()
            .filter(|s| s.session_id != exclude_id)
            .map(|s| s.name.as_str())
            .collect();
        if !taken.contains(proposed) {
            return proposed.to_string();
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{proposed} ({n})");
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
            n += 1;
        }
    }
}
