//! Connection manager — upstream lifecycle, backoff, classification.
//!
//! Owns the single upstream connection and the one live
//! [`ConnectionStatus`] instance. The watcher loop feeds transport events
//! in and asks for the next reconnect delay; the manager never returns
//! connection failures to callers — everything lands in status and the log.
//!
//! # States
//!
//! ```text
//! Disconnected → Connecting → { AwaitingPairing | Connected }
//! Connected → Disconnected            (retryable close, backoff)
//! Connected → LoggedOut               (auth invalidated, terminal)
//! Connected → Disconnected (inflated) (session replaced; halted at 3)
//! ```
//!
//! Backoff: `delay = min(initial × 2^(attempts−1), cap)`, attempts reset on
//! a successful open. A session-replacement floors the attempt counter so
//! the minimum delay is longer, avoiding a thrash loop against whichever
//! process took the connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::WatcherError;
use crate::identity;
use crate::transport::{
    CloseReason, OutboundPayload, SelfIdentity, SendReceipt, Transport, TransportEventSender,
    TransportHandle,
};

/// First reconnection delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnection delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Attempt-counter floor applied after a session replacement
/// (`1s × 2^(4−1)` = 8 s minimum delay).
const REPLACED_ATTEMPT_FLOOR: u32 = 4;

/// Session replacements tolerated before retries halt.
const MAX_REPLACEMENTS: u32 = 3;

/// Live connection status, read by every IPC handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatus {
    /// Whether the upstream connection is open.
    pub connected: bool,
    /// Whether a pairing challenge is pending user action.
    pub awaiting_pairing: bool,
    /// Terminal: credentials invalidated, waiting for `trigger_login`.
    pub logged_out: bool,
    /// Terminal: repeated session replacement, retries halted.
    pub replaced_halted: bool,
    /// Canonical self address (phone-number-like id), once connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_address: Option<String>,
    /// Internal linked identifier, when the network exposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_linked_id: Option<String>,
    /// Most recent connection-level failure, for `status` output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Classification of an inbound event's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The authenticated account messaging itself.
    SelfChat,
    /// Anyone else.
    ThirdParty,
}

/// What the watcher loop should do after a close or failed open.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule a reconnect after the given delay.
    After(Duration),
    /// Do not retry; a terminal state was entered.
    Halt,
}

/// Owns the upstream connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    credentials_dir: PathBuf,
    events_tx: TransportEventSender,
    handle: Option<Box<dyn TransportHandle>>,
    status: ConnectionStatus,
    /// Consecutive failed opens/closes since the last successful open.
    attempts: u32,
    /// Session replacements observed since the last `trigger_login`.
    replacements: u32,
    /// Normalized self-identity forms for classification.
    self_forms: Vec<String>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("replacements", &self.replacements)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager for the given transport and credential directory.
    ///
    /// `events_tx` is handed to the transport on every open; the watcher
    /// loop drains the receiving side.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials_dir: PathBuf,
        events_tx: TransportEventSender,
    ) -> Self {
        Self {
            transport,
            credentials_dir,
            events_tx,
            handle: None,
            status: ConnectionStatus::default(),
            attempts: 0,
            replacements: 0,
            self_forms: Vec::new(),
        }
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Attempt to open the upstream connection.
    ///
    /// On failure the attempt counter advances and the caller gets the
    /// delay to wait before the next attempt.
    pub async fn connect(&mut self) -> std::result::Result<(), RetryDecision> {
        if self.status.logged_out || self.status.replaced_halted {
            return Err(RetryDecision::Halt);
        }
        // A handle stays live until on_closed takes it; a queued
        // reconnect arriving before then must not open a second
        // upstream connection.
        if self.handle.is_some() {
            log::debug!("[Connection] open skipped, handle still live");
            return Ok(());
        }
        log::info!("[Connection] opening (attempt {})", self.attempts + 1);
        match self
            .transport
            .open(&self.credentials_dir, self.events_tx.clone())
            .await
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::warn!("[Connection] open failed: {e:#}");
                self.status.last_error = Some(format!("{e:#}"));
                self.attempts += 1;
                Err(RetryDecision::After(backoff_delay(self.attempts)))
            }
        }
    }

    /// A pairing challenge arrived; the user must complete it.
    pub fn on_pairing_challenge(&mut self, challenge: &str) {
        self.status.awaiting_pairing = true;
        log::info!("[Connection] pairing required: {challenge}");
    }

    /// The connection opened; capture self-identity forms.
    pub fn on_opened(&mut self, identity: &SelfIdentity) {
        self.status.connected = true;
        self.status.awaiting_pairing = false;
        self.status.last_error = None;
        self.attempts = 0;

        self.self_forms.clear();
        self.self_forms.push(identity::normalize(&identity.address));
        if let Some(ref linked) = identity.linked_id {
            self.self_forms.push(identity::normalize(linked));
        }
        self.status.self_address = Some(identity::normalize(&identity.address));
        self.status.self_linked_id = identity.linked_id.as_deref().map(identity::normalize);
        log::info!(
            "[Connection] connected as {}",
            self.status.self_address.as_deref().unwrap_or("?")
        );
    }

    /// The connection closed; classify the reason and decide on a retry.
    pub fn on_closed(&mut self, reason: &CloseReason) -> RetryDecision {
        self.status.connected = false;
        self.handle = None;

        match reason {
            CloseReason::AuthInvalidated => {
                log::warn!("[Connection] auth invalidated, halting until trigger_login");
                self.status.logged_out = true;
                self.status.last_error = Some(WatcherError::AuthInvalidated.to_string());
                RetryDecision::Halt
            }
            CloseReason::SessionReplaced => {
                self.replacements += 1;
                if self.replacements >= MAX_REPLACEMENTS {
                    log::warn!(
                        "[Connection] session replaced {} times, another instance holds the connection",
                        self.replacements
                    );
                    self.status.replaced_halted = true;
                    self.status.last_error = Some(WatcherError::SessionReplaced.to_string());
                    return RetryDecision::Halt;
                }
                // Floor the counter so the next delay is well above the
                // initial value; two instances pinging the network apart.
                self.attempts = self.attempts.max(REPLACED_ATTEMPT_FLOOR);
                self.status.last_error = Some(WatcherError::SessionReplaced.to_string());
                let delay = backoff_delay(self.attempts);
                log::warn!(
                    "[Connection] session replaced ({}/{}), retry in {:?}",
                    self.replacements,
                    MAX_REPLACEMENTS,
                    delay
                );
                RetryDecision::After(delay)
            }
            CloseReason::Other(detail) => {
                self.attempts += 1;
                self.status.last_error =
                    Some(WatcherError::Transport(detail.clone()).to_string());
                let delay = backoff_delay(self.attempts);
                log::info!("[Connection] closed ({detail}), retry in {delay:?}");
                RetryDecision::After(delay)
            }
        }
    }

    /// Persist rotated credential material from the transport.
    pub fn on_credentials_updated(&self, material: &serde_json::Value) -> Result<()> {
        let path = self.credentials_dir.join("credentials.json");
        let json = serde_json::to_string(material)?;
        std::fs::write(&path, json)
            .with_context(|| format!("persist credentials: {}", path.display()))
    }

    /// Idempotently tear down and reset so a fresh pairing challenge is
    /// produced, without restarting the process.
    pub async fn trigger_login(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
        self.status = ConnectionStatus::default();
        self.attempts = 0;
        self.replacements = 0;
        self.self_forms.clear();
        log::info!("[Connection] login re-triggered, state reset");
    }

    /// Classify an inbound sender against the captured self-identity forms.
    #[must_use]
    pub fn classify(&self, sender: &str) -> Classification {
        let normalized = identity::normalize(sender);
        if self.self_forms.iter().any(|form| *form == normalized) {
            Classification::SelfChat
        } else {
            Classification::ThirdParty
        }
    }

    /// Send a payload upstream. Fails when the connection is down; the
    /// failure is reported to the caller, not retried.
    pub async fn send(&self, target: &str, payload: OutboundPayload) -> Result<SendReceipt> {
        let handle = self
            .handle
            .as_ref()
            .context("not connected to the messaging network")?;
        handle.send(target, payload).await
    }

    /// Whether a live handle exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.connected
    }

    /// Close the upstream connection for shutdown.
    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
        self.status.connected = false;
    }
}

/// `min(initial × 2^(attempts−1), cap)` for `attempts ≥ 1`.
#[must_use]
pub fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(31);
    let delay = INITIAL_BACKOFF.saturating_mul(1u32 << exp);
    delay.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportEvent};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport whose opens can be toggled to fail.
    #[derive(Default)]
    struct FlakyTransport {
        fail: AtomicBool,
    }

    struct NoopHandle;

    #[async_trait]
    impl TransportHandle for NoopHandle {
        async fn send(&self, _target: &str, _payload: OutboundPayload) -> Result<SendReceipt> {
            Ok(SendReceipt {
                message_id: "id".to_string(),
            })
        }
        async fn close(&self) {}
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn open(
            &self,
            _credentials_dir: &Path,
            _events: TransportEventSender,
        ) -> Result<Box<dyn TransportHandle>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("refused");
            }
            Ok(Box::new(NoopHandle))
        }
    }

    fn manager(transport: Arc<FlakyTransport>) -> ConnectionManager {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
        ConnectionManager::new(transport, std::env::temp_dir(), tx)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let delays: Vec<u64> = (1..=8).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn test_attempts_reset_after_successful_open() {
        let transport = Arc::new(FlakyTransport::default());
        let mut mgr = manager(Arc::clone(&transport));

        transport.fail.store(true, Ordering::SeqCst);
        assert_eq!(
            mgr.connect().await.unwrap_err(),
            RetryDecision::After(Duration::from_secs(1))
        );
        assert_eq!(
            mgr.connect().await.unwrap_err(),
            RetryDecision::After(Duration::from_secs(2))
        );

        transport.fail.store(false, Ordering::SeqCst);
        mgr.connect().await.unwrap();
        mgr.on_opened(&SelfIdentity {
            address: "me@s.net".to_string(),
            linked_id: None,
        });

        // Next failure starts over at the initial delay.
        transport.fail.store(true, Ordering::SeqCst);
        assert_eq!(
            mgr.connect().await.unwrap_err(),
            RetryDecision::After(Duration::from_secs(1))
        );
    }

    /// Transport that counts opens and handle closes.
    #[derive(Default)]
    struct CountingTransport {
        opens: std::sync::atomic::AtomicU32,
        closes: Arc<std::sync::atomic::AtomicU32>,
    }

    struct CountingHandle {
        closes: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl TransportHandle for CountingHandle {
        async fn send(&self, _target: &str, _payload: OutboundPayload) -> Result<SendReceipt> {
            Ok(SendReceipt {
                message_id: "id".to_string(),
            })
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn open(
            &self,
            _credentials_dir: &Path,
            _events: TransportEventSender,
        ) -> Result<Box<dyn TransportHandle>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingHandle {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[tokio::test]
    async fn test_connect_with_live_handle_does_not_reopen() {
        let transport = Arc::new(CountingTransport::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
        let mut mgr = ConnectionManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            std::env::temp_dir(),
            tx,
        );

        mgr.connect().await.unwrap();
        // A stale reconnect timer firing while the handle is live must
        // not stack a second upstream connection on the first.
        mgr.connect().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 0);

        // After a close the next connect opens again.
        mgr.on_closed(&CloseReason::Other("eof".to_string()));
        mgr.connect().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_invalidated_halts_until_trigger_login() {
        let transport = Arc::new(FlakyTransport::default());
        let mut mgr = manager(Arc::clone(&transport));
        mgr.connect().await.unwrap();

        assert_eq!(
            mgr.on_closed(&CloseReason::AuthInvalidated),
            RetryDecision::Halt
        );
        assert!(mgr.status().logged_out);
        assert_eq!(mgr.connect().await.unwrap_err(), RetryDecision::Halt);

        mgr.trigger_login().await;
        assert!(!mgr.status().logged_out);
        mgr.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_replaced_inflates_then_halts() {
        let transport = Arc::new(FlakyTransport::default());
        let mut mgr = manager(Arc::clone(&transport));
        mgr.connect().await.unwrap();

        // First two replacements retry with the floored (inflated) delay.
        match mgr.on_closed(&CloseReason::SessionReplaced) {
            RetryDecision::After(delay) => assert_eq!(delay, Duration::from_secs(8)),
            RetryDecision::Halt => panic!("should retry"),
        }
        match mgr.on_closed(&CloseReason::SessionReplaced) {
            RetryDecision::After(delay) => assert!(delay >= Duration::from_secs(8)),
            RetryDecision::Halt => panic!("should retry"),
        }

        // Third replacement halts.
        assert_eq!(
            mgr.on_closed(&CloseReason::SessionReplaced),
            RetryDecision::Halt
        );
        assert!(mgr.status().replaced_halted);
        assert_eq!(
            mgr.status().last_error.as_deref(),
            Some(WatcherError::SessionReplaced.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_close_reasons_map_onto_error_taxonomy() {
        let transport = Arc::new(FlakyTransport::default());
        let mut mgr = manager(Arc::clone(&transport));
        mgr.connect().await.unwrap();

        mgr.on_closed(&CloseReason::Other("stream reset".to_string()));
        assert_eq!(
            mgr.status().last_error.as_deref(),
            Some(
                WatcherError::Transport("stream reset".to_string())
                    .to_string()
                    .as_str()
            )
        );

        mgr.on_closed(&CloseReason::AuthInvalidated);
        assert_eq!(
            mgr.status().last_error.as_deref(),
            Some(WatcherError::AuthInvalidated.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_classification_strips_device_suffix() {
        let transport = Arc::new(FlakyTransport::default());
        let mut mgr = manager(transport);
        mgr.on_opened(&SelfIdentity {
            address: "4915551234:3@s.net".to_string(),
            linked_id: Some("77:1@lid".to_string()),
        });

        assert_eq!(mgr.classify("4915551234:9@s.net"), Classification::SelfChat);
        assert_eq!(mgr.classify("77@lid"), Classification::SelfChat);
        assert_eq!(mgr.classify("other@s.net"), Classification::ThirdParty);
    }
}
