//! Message router — queues, long-poll waiters, and echo suppression.
//!
//! Inbound events classified by the connection manager land here. Self-chat
//! messages go to the active session: a pending waiter is fired immediately
//! with a single-element batch, otherwise the message is appended to the
//! session's FIFO queue. Third-party messages update the contact directory
//! and queue under the sender's normalized identity; contact queues are
//! polled, never waited on.
//!
//! Waiter resolution is exclusive by construction: whichever of dispatch,
//! timeout, or client disconnect removes the entry from the waiter map owns
//! its one-shot sender. A timer id distinguishes a stale timeout from a
//! re-registered waiter for the same session.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::identity;
use crate::transport::InboundMessage;

/// How long an outbound message id is remembered for echo suppression.
pub const SENT_ID_TTL: Duration = Duration::from_secs(30);

/// One queued inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Message body text.
    pub body: String,
    /// Network timestamp.
    pub timestamp: DateTime<Utc>,
    /// Normalized sender identity; `None` for self-chat messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Contact directory entry, keyed by normalized identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEntry {
    /// Normalized sender identity.
    pub identity: String,
    /// Last display name seen for this identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Timestamp of the most recent message.
    pub last_seen: DateTime<Utc>,
}

/// A pending long-poll, resolved exactly once.
#[derive(Debug)]
pub struct Waiter {
    /// IPC connection the reply goes to (for disconnect teardown).
    pub conn_id: String,
    /// Timer generation; a timeout only fires if this still matches.
    pub timer_id: u64,
    /// One-shot reply channel back to the connection task.
    pub tx: oneshot::Sender<Vec<QueuedMessage>>,
}

/// Summary of one chat for `list_chats`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    /// Normalized identity (or the self address for the self chat).
    pub identity: String,
    /// Display name, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Messages currently queued and undrained.
    pub pending: usize,
    /// Timestamp of the newest message seen in this chat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Owns every per-session and per-contact queue plus the waiter table.
#[derive(Debug, Default)]
pub struct MessageRouter {
    /// Self-chat FIFO queues, keyed by session id.
    self_queues: HashMap<String, VecDeque<QueuedMessage>>,
    /// Third-party FIFO queues, keyed by normalized identity.
    contact_queues: HashMap<String, VecDeque<QueuedMessage>>,
    /// Contact directory, keyed by normalized identity.
    contacts: HashMap<String, ContactEntry>,
    /// Pending long-polls, keyed by session id.
    waiters: HashMap<String, Waiter>,
    /// Outbound ids awaiting their echoed copy.
    sent_ids: HashMap<String, Instant>,
    /// Bounded recent-message ring per chat, serving `fetch_history`.
    history: HashMap<String, VecDeque<QueuedMessage>>,
    /// Messages retained per history ring.
    history_limit: usize,
    next_timer_id: u64,
}

impl MessageRouter {
    /// Router retaining `history_limit` messages per chat.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            ..Self::default()
        }
    }

    /// Restore the contact directory from persisted caches.
    pub fn load_contacts(&mut self, contacts: Vec<ContactEntry>) {
        for contact in contacts {
            self.contacts.insert(contact.identity.clone(), contact);
        }
    }

    /// Export the contact directory for persistence.
    #[must_use]
    pub fn contacts_snapshot(&self) -> Vec<ContactEntry> {
        let mut contacts: Vec<ContactEntry> = self.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        contacts
    }

    // ─── Echo suppression ──────────────────────────────────────────────────

    /// Remember an outbound transport id for echo suppression.
    pub fn note_sent(&mut self, message_id: &str) {
        self.purge_sent(Instant::now());
        self.sent_ids.insert(message_id.to_string(), Instant::now());
    }

    /// Whether an inbound self-chat id is an echo of our own send.
    ///
    /// First match only: the id is removed, so a later distinct event
    /// reusing it is delivered normally.
    pub fn suppress_echo(&mut self, message_id: &str) -> bool {
        self.purge_sent(Instant::now());
        self.sent_ids.remove(message_id).is_some()
    }

    /// Drop remembered ids older than [`SENT_ID_TTL`] as of `now`.
    pub(crate) fn purge_sent(&mut self, now: Instant) {
        self.sent_ids
            .retain(|_, sent_at| now.duration_since(*sent_at) < SENT_ID_TTL);
    }

    // ─── Self-chat dispatch ────────────────────────────────────────────────

    /// Dispatch a self-chat message to the active session.
    ///
    /// Fires a pending waiter with a single-element batch when one exists,
    /// otherwise appends to the session's queue. With no active session the
    /// message is recorded in history only.
    pub fn dispatch_self(&mut self, active: Option<&str>, message: QueuedMessage, chat: &str) {
        self.push_history(chat, message.clone());
        let Some(session_id) = active else {
            log::warn!("[Router] self-chat message with no active session, not queued");
            return;
        };
        if let Some(waiter) = self.waiters.remove(session_id) {
            if waiter.tx.send(vec![message]).is_err() {
                log::debug!("[Router] waiter for {session_id} gone before dispatch");
            }
            return;
        }
        self.self_queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(message);
    }

    /// Dispatch a third-party message: update the contact directory and
    /// append to the sender's queue.
    pub fn dispatch_contact(&mut self, message: &InboundMessage) {
        let key = identity::normalize(&message.sender);
        let entry = self
            .contacts
            .entry(key.clone())
            .or_insert_with(|| ContactEntry {
                identity: key.clone(),
                name: None,
                last_seen: message.timestamp,
            });
        if message.sender_name.is_some() {
            entry.name.clone_from(&message.sender_name);
        }
        entry.last_seen = message.timestamp;

        let queued = QueuedMessage {
            body: message.body.clone(),
            timestamp: message.timestamp,
            sender: Some(key.clone()),
        };
        self.push_history(&key, queued.clone());
        self.contact_queues.entry(key).or_default().push_back(queued);
    }

    // ─── Draining ──────────────────────────────────────────────────────────

    /// Drain a session's self-chat queue, front first.
    pub fn drain_self(&mut self, session_id: &str) -> Vec<QueuedMessage> {
        self.self_queues
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drain one contact's queue, front first.
    pub fn drain_contact(&mut self, identity: &str) -> Vec<QueuedMessage> {
        let key = identity::normalize(identity);
        self.contact_queues
            .remove(&key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drain the session's self queue and every contact queue, merged into
    /// one timestamp-ascending sequence.
    ///
    /// Lossless and duplication-free relative to the individual queues at
    /// call time; the sort is stable so same-timestamp messages keep their
    /// per-queue arrival order.
    pub fn drain_all(&mut self, session_id: &str) -> Vec<QueuedMessage> {
        let mut merged = self.drain_self(session_id);
        let identities: Vec<String> = self.contact_queues.keys().cloned().collect();
        for identity in identities {
            merged.extend(self.drain_contact(&identity));
        }
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        merged
    }

    /// Whether a session has queued self-chat messages.
    #[must_use]
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.self_queues
            .get(session_id)
            .is_some_and(|q| !q.is_empty())
    }

    // ─── Waiters ───────────────────────────────────────────────────────────

    /// Register a long-poll waiter for a session. Returns the timer id the
    /// caller arms its timeout with.
    ///
    /// A previous waiter for the same session is resolved with an empty
    /// batch — one pending long-poll per session.
    pub fn register_waiter(
        &mut self,
        session_id: &str,
        conn_id: &str,
        tx: oneshot::Sender<Vec<QueuedMessage>>,
    ) -> u64 {
        self.next_timer_id += 1;
        let timer_id = self.next_timer_id;
        if let Some(previous) = self.waiters.insert(
            session_id.to_string(),
            Waiter {
                conn_id: conn_id.to_string(),
                timer_id,
                tx,
            },
        ) {
            let _ = previous.tx.send(Vec::new());
        }
        timer_id
    }

    /// Resolve a waiter on timeout. Only fires when the timer generation
    /// still matches — a stale timer must not touch a newer waiter.
    pub fn take_waiter_on_timeout(&mut self, session_id: &str, timer_id: u64) -> Option<Waiter> {
        match self.waiters.get(session_id) {
            Some(waiter) if waiter.timer_id == timer_id => self.waiters.remove(session_id),
            _ => None,
        }
    }

    /// Remove (without resolving) every waiter held by a disconnected
    /// IPC connection.
    pub fn remove_waiters_for_conn(&mut self, conn_id: &str) {
        self.waiters.retain(|_, waiter| waiter.conn_id != conn_id);
    }

    /// Drop all routed state for a session (on end/prune).
    pub fn remove_session(&mut self, session_id: &str) {
        self.self_queues.remove(session_id);
        self.waiters.remove(session_id);
    }

    // ─── Contacts, chats, history ──────────────────────────────────────────

    /// Contact directory ordered by most recently seen.
    #[must_use]
    pub fn list_contacts(&self) -> Vec<ContactEntry> {
        self.contacts_snapshot()
    }

    /// Resolve a display name to a normalized identity, if unique.
    #[must_use]
    pub fn resolve_contact(&self, target: &str) -> Option<String> {
        let key = identity::normalize(target);
        if self.contacts.contains_key(&key) {
            return Some(key);
        }
        let mut matches = self
            .contacts
            .values()
            .filter(|c| c.name.as_deref() == Some(target));
        match (matches.next(), matches.next()) {
            (Some(contact), None) => Some(contact.identity.clone()),
            _ => None,
        }
    }

    /// Per-chat summaries: every contact plus the self chat.
    #[must_use]
    pub fn list_chats(&self, self_address: Option<&str>, active: Option<&str>) -> Vec<ChatSummary> {
        let mut chats = Vec::new();
        if let Some(address) = self_address {
            let pending = active
                .and_then(|id| self.self_queues.get(id))
                .map_or(0, VecDeque::len);
            chats.push(ChatSummary {
                identity: address.to_string(),
                name: Some("self".to_string()),
                pending,
                last_timestamp: self
                    .history
                    .get(address)
                    .and_then(|ring| ring.back())
                    .map(|m| m.timestamp),
            });
        }
        for contact in self.contacts_snapshot() {
            chats.push(ChatSummary {
                pending: self
                    .contact_queues
                    .get(&contact.identity)
                    .map_or(0, VecDeque::len),
                last_timestamp: Some(contact.last_seen),
                name: contact.name,
                identity: contact.identity,
            });
        }
        chats
    }

    /// Recent messages for one chat, oldest first, at most `limit`.
    #[must_use]
    pub fn history(&self, chat: &str, limit: usize) -> Vec<QueuedMessage> {
        let key = identity::normalize(chat);
        self.history
            .get(&key)
            .map(|ring| {
                ring.iter()
                    .rev()
                    .take(limit)
                    .rev()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn push_history(&mut self, chat: &str, message: QueuedMessage) {
        let key = identity::normalize(chat);
        let ring = self.history.entry(key).or_default();
        ring.push_back(message);
        while ring.len() > self.history_limit {
            ring.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(body: &str, secs: i64) -> QueuedMessage {
        QueuedMessage {
            body: body.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            sender: None,
        }
    }

    fn inbound(id: &str, sender: &str, body: &str, secs: i64) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            sender_name: None,
            body: body.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_echo_suppressed_exactly_once() {
        let mut router = MessageRouter::new(100);
        router.note_sent("m1");
        assert!(router.suppress_echo("m1"), "first echo is dropped");
        assert!(
            !router.suppress_echo("m1"),
            "a later event reusing the id is delivered"
        );
    }

    #[test]
    fn test_sent_ids_expire_after_ttl() {
        let mut router = MessageRouter::new(100);
        router.note_sent("m1");
        router.purge_sent(Instant::now() + SENT_ID_TTL + Duration::from_secs(1));
        assert!(!router.suppress_echo("m1"));
    }

    #[test]
    fn test_dispatch_queues_when_no_waiter() {
        let mut router = MessageRouter::new(100);
        router.dispatch_self(Some("a"), msg("hello", 1), "me@s.net");
        router.dispatch_self(Some("a"), msg("world", 2), "me@s.net");

        let drained = router.drain_self("a");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, "hello", "arrival order preserved");
        assert_eq!(drained[1].body, "world");
        assert!(router.drain_self("a").is_empty(), "second drain is empty");
    }

    #[tokio::test]
    async fn test_dispatch_fires_waiter_and_skips_queue() {
        let mut router = MessageRouter::new(100);
        let (tx, rx) = oneshot::channel();
        router.register_waiter("a", "conn1", tx);

        router.dispatch_self(Some("a"), msg("hello", 1), "me@s.net");

        let batch = rx.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "hello");
        // The batch delivered to the waiter is not also queued.
        assert!(router.drain_self("a").is_empty());
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_resolve_new_waiter() {
        let mut router = MessageRouter::new(100);
        let (tx1, _rx1) = oneshot::channel();
        let old_timer = router.register_waiter("a", "conn1", tx1);
        let (tx2, _rx2) = oneshot::channel();
        let _new_timer = router.register_waiter("a", "conn2", tx2);

        assert!(router.take_waiter_on_timeout("a", old_timer).is_none());
        assert!(router.waiters.contains_key("a"));
    }

    #[test]
    fn test_waiter_removed_on_client_disconnect() {
        let mut router = MessageRouter::new(100);
        let (tx, _rx) = oneshot::channel();
        router.register_waiter("a", "conn1", tx);
        router.remove_waiters_for_conn("conn1");

        // With the waiter gone a dispatch queues instead of firing.
        router.dispatch_self(Some("a"), msg("hello", 1), "me@s.net");
        assert_eq!(router.drain_self("a").len(), 1);
    }

    #[test]
    fn test_contact_dispatch_updates_directory() {
        let mut router = MessageRouter::new(100);
        let mut message = inbound("m1", "4915551234:7@s.net", "hey", 5);
        message.sender_name = Some("Ada".to_string());
        router.dispatch_contact(&message);

        let contacts = router.list_contacts();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].identity, "4915551234@s.net");
        assert_eq!(contacts[0].name.as_deref(), Some("Ada"));

        let drained = router.drain_contact("4915551234@s.net");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sender.as_deref(), Some("4915551234@s.net"));
    }

    #[test]
    fn test_drain_all_merges_time_ascending_without_loss() {
        let mut router = MessageRouter::new(100);
        router.dispatch_self(Some("a"), msg("s1", 10), "me@s.net");
        router.dispatch_self(Some("a"), msg("s2", 30), "me@s.net");
        router.dispatch_contact(&inbound("m1", "x@s.net", "c1", 20));
        router.dispatch_contact(&inbound("m2", "y@s.net", "c2", 5));

        let merged = router.drain_all("a");
        let bodies: Vec<&str> = merged.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["c2", "s1", "c1", "s2"]);

        // Nothing left behind in any queue.
        assert!(router.drain_all("a").is_empty());
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let mut router = MessageRouter::new(3);
        for i in 0..5 {
            router.dispatch_contact(&inbound(&format!("m{i}"), "x@s.net", &format!("b{i}"), i));
        }
        let history = router.history("x@s.net", 10);
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["b2", "b3", "b4"]);

        let limited = router.history("x@s.net", 2);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].body, "b3");
    }

    #[test]
    fn test_resolve_contact_by_name_and_identity() {
        let mut router = MessageRouter::new(100);
        let mut message = inbound("m1", "4915551234@s.net", "hey", 5);
        message.sender_name = Some("Ada".to_string());
        router.dispatch_contact(&message);

        assert_eq!(
            router.resolve_contact("Ada").as_deref(),
            Some("4915551234@s.net")
        );
        assert_eq!(
            router.resolve_contact("4915551234:9@s.net").as_deref(),
            Some("4915551234@s.net")
        );
        assert!(router.resolve_contact("Nobody").is_none());
    }
}
