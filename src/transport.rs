//! Upstream transport collaborator.
//!
//! The remote network's wire and cryptographic protocol is delegated to an
//! external implementation behind the [`Transport`] trait. The watcher only
//! sees the narrow surface it needs: open with credentials, an event stream
//! (pairing challenge, opened, closed, inbound message, credential change),
//! and a send call that returns the transport-assigned message id.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

/// Channel the transport feeds its events into.
pub type TransportEventSender = UnboundedSender<TransportEvent>;

/// Self-identity forms captured when the connection opens.
///
/// The network may expose the account under two addresses: the canonical
/// phone-number-like address and an internal linked identifier. Inbound
/// classification compares against both, normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfIdentity {
    /// Canonical address (phone-number-like id at the network domain).
    pub address: String,
    /// Internal linked identifier, when the network exposes one.
    pub linked_id: Option<String>,
}

/// Why the upstream connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Credentials invalidated remotely — terminal until re-pairing.
    AuthInvalidated,
    /// Another process took over the account's session.
    SessionReplaced,
    /// Anything else — retried via normal backoff.
    Other(String),
}

/// An inbound message event from the network.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport-assigned message id.
    pub id: String,
    /// Raw sender identity, possibly device-decorated.
    pub sender: String,
    /// Display name the network attached to the sender, if any.
    pub sender_name: Option<String>,
    /// Message body text.
    pub body: String,
    /// Network timestamp of the message.
    pub timestamp: DateTime<Utc>,
}

/// Event pushed by the transport to the watcher loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A pairing challenge the user must complete (e.g. scan a code).
    PairingChallenge(String),
    /// The connection is up; carries the captured self-identity.
    Opened(SelfIdentity),
    /// The connection closed for the given reason.
    Closed(CloseReason),
    /// An inbound message arrived.
    Message(InboundMessage),
    /// The transport rotated credential material; the watcher persists it.
    CredentialsUpdated(serde_json::Value),
}

/// Payload for an outbound send.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    /// Plain text message.
    Text(String),
    /// File attachment by local path.
    File(PathBuf),
    /// Synthesized voice note by local path.
    Voice(PathBuf),
}

/// Receipt for a completed send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Transport-assigned id of the outbound message, used for echo
    /// suppression when the network reflects it back.
    pub message_id: String,
}

/// Live connection handle returned by [`Transport::open`].
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a payload to a target identity. Returns the assigned id.
    async fn send(&self, target: &str, payload: OutboundPayload) -> Result<SendReceipt>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Factory for upstream connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection using credential material under `credentials_dir`,
    /// delivering events to `events` until the connection closes.
    async fn open(
        &self,
        credentials_dir: &Path,
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportHandle>>;
}

// ─── Loopback transport ────────────────────────────────────────────────────

/// Development transport with no remote side.
///
/// Opens immediately with a fixed identity and acknowledges sends with
/// generated ids. Lets the daemon, socket protocol, and clients be exercised
/// end to end on a machine with no network account paired.
#[derive(Debug, Default)]
pub struct LoopbackTransport;

struct LoopbackHandle;

#[async_trait]
impl TransportHandle for LoopbackHandle {
    async fn send(&self, target: &str, payload: OutboundPayload) -> Result<SendReceipt> {
        log::debug!("[Loopback] send to {target}: {payload:?}");
        Ok(SendReceipt {
            message_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn close(&self) {}
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        _credentials_dir: &Path,
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        let _ = events.send(TransportEvent::Opened(SelfIdentity {
            address: "loopback@local".to_string(),
            linked_id: None,
        }));
        Ok(Box::new(LoopbackHandle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_opens_and_acks_sends() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = LoopbackTransport
            .open(Path::new("/tmp"), tx)
            .await
            .unwrap();

        match rx.recv().await {
            Some(TransportEvent::Opened(identity)) => {
                assert_eq!(identity.address, "loopback@local");
            }
            other => panic!("expected Opened, got {other:?}"),
        }

        let receipt = handle
            .send("loopback@local", OutboundPayload::Text("hi".into()))
            .await
            .unwrap();
        assert!(!receipt.message_id.is_empty());
    }
}
