//! Watcher — central orchestrator for the courier daemon.
//!
//! The watcher owns all mutable state and runs the main event loop. IPC
//! connection tasks and the transport never touch state directly; they
//! push events into the loop, which mutates on a single logical thread.
//! No state is behind a lock.
//!
//! # Architecture
//!
//! ```text
//!              ┌───────────────────────┐
//!              │        Watcher        │
//!              │  - Owns all state     │
//!              │  - Runs event loop    │
//!              │  - Source of truth    │
//!              └───────────┬───────────┘
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!          ▼               ▼               ▼
//!     IpcServer       Transport       Collaborators
//!   (Unix socket)   (remote network)  (tmux / say)
//! ```

pub mod events;
pub mod handlers;
pub mod run;

pub use events::WatcherEvent;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::persist::{Caches, Store};
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::speech::{SpeechSynth, VoiceConfig};
use crate::terminal::TerminalDriver;
use crate::transport::{Transport, TransportEvent};

/// Central orchestrator for the courier daemon.
///
/// Owns the connection manager, session registry, message router, and
/// persistence store. Collaborator processes (terminal multiplexer,
/// speech program) sit behind trait objects.
pub struct Watcher {
    /// Application configuration.
    pub config: Config,
    /// Upstream connection lifecycle and classification.
    pub connection: ConnectionManager,
    /// Registered client sessions.
    pub registry: SessionRegistry,
    /// Queues, waiters, contacts, echo suppression.
    pub router: MessageRouter,
    /// Registry and cache persistence.
    pub store: Store,
    /// Terminal-multiplexer automation.
    pub terminal: Box<dyn TerminalDriver>,
    /// Text-to-speech.
    pub speech: Box<dyn SpeechSynth>,
    /// Current voice settings (persisted in the caches).
    pub voice: VoiceConfig,

    event_tx: UnboundedSender<WatcherEvent>,
    /// Taken by `run`; `Some` until then.
    event_rx: Option<UnboundedReceiver<WatcherEvent>>,
    /// Taken by `run`; `Some` until then.
    transport_rx: Option<UnboundedReceiver<TransportEvent>>,
    /// Set by the Shutdown event.
    quit: bool,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("connection", &self.connection)
            .field("registry", &self.registry)
            .field("quit", &self.quit)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Create a watcher, restoring the registry and caches from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be created or a
    /// persisted file is unreadable.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        terminal: Box<dyn TerminalDriver>,
        speech: Box<dyn SpeechSynth>,
    ) -> Result<Self> {
        let store = Store::new(Config::config_dir()?)?;
        let registry = SessionRegistry::from_snapshot(store.load_registry()?);
        let caches = store.load_caches()?;

        let mut router = MessageRouter::new(config.history_limit);
        router.load_contacts(caches.contacts);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let connection =
            ConnectionManager::new(transport, config.credentials_dir()?, transport_tx);

        log::info!(
            "[Watcher] restored {} session(s), {} contact(s)",
            registry.len(),
            router.list_contacts().len()
        );

        Ok(Self {
            config,
            connection,
            registry,
            router,
            store,
            terminal,
            speech,
            voice: caches.voice,
            event_tx,
            event_rx: Some(event_rx),
            transport_rx: Some(transport_rx),
            quit: false,
        })
    }

    /// Sender for injecting events (signal handlers, tests).
    #[must_use]
    pub fn event_sender(&self) -> UnboundedSender<WatcherEvent> {
        self.event_tx.clone()
    }

    /// Write the registry to disk, logging on failure rather than
    /// failing the request that mutated it.
    pub(crate) fn persist_registry(&self) {
        if let Err(e) = self.store.save_registry(&self.registry.snapshot()) {
            log::error!("[Watcher] failed to persist registry: {e:#}");
        }
    }

    /// Write the caches (contacts, voice settings) to disk.
    pub(crate) fn persist_caches(&self) {
        let caches = Caches {
            contacts: self.router.contacts_snapshot(),
            voice: self.voice.clone(),
        };
        if let Err(e) = self.store.save_caches(&caches) {
            log::error!("[Watcher] failed to persist caches: {e:#}");
        }
    }
}
