//! Watcher event loop.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::connection::{Classification, RetryDecision};
use crate::ipc::IpcServer;
use crate::router::QueuedMessage;
use crate::transport::{InboundMessage, TransportEvent};
use crate::watcher::events::WatcherEvent;
use crate::watcher::Watcher;

impl Watcher {
    /// Run the daemon until a Shutdown event.
    ///
    /// Starts the IPC server, opens the upstream connection, and drives
    /// the event loop. On exit the upstream connection is closed, state
    /// is flushed to disk, and the socket file is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the receivers
    /// were already taken (run called twice).
    pub async fn run(mut self) -> Result<()> {
        let socket_path = self.config.socket_path()?;
        let server = IpcServer::start(socket_path, self.event_sender())?;

        self.try_connect().await;

        let mut event_rx = self
            .event_rx
            .take()
            .context("watcher event receiver already taken")?;
        let mut transport_rx = self
            .transport_rx
            .take()
            .context("transport event receiver already taken")?;

        while !self.quit {
            tokio::select! {
                Some(event) = event_rx.recv() => self.handle_event(event).await,
                Some(event) = transport_rx.recv() => self.handle_transport(event),
                else => break,
            }
        }

        log::info!("[Watcher] shutting down");
        self.connection.close().await;
        self.persist_registry();
        self.persist_caches();
        server.shutdown();
        Ok(())
    }

    async fn handle_event(&mut self, event: WatcherEvent) {
        match event {
            WatcherEvent::IpcRequest {
                conn_id,
                request,
                reply_tx,
            } => self.handle_ipc(conn_id, request, reply_tx).await,
            WatcherEvent::ClientGone { conn_id } => {
                self.router.remove_waiters_for_conn(&conn_id);
            }
            WatcherEvent::WaitTimeout {
                session_id,
                timer_id,
            } => {
                // Stale timers miss here: the waiter they armed was
                // already resolved and possibly replaced.
                if let Some(waiter) = self.router.take_waiter_on_timeout(&session_id, timer_id) {
                    let _ = waiter.tx.send(Vec::new());
                }
            }
            WatcherEvent::Reconnect => {
                if !self.connection.is_connected() {
                    self.try_connect().await;
                }
            }
            WatcherEvent::Shutdown => {
                self.quit = true;
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PairingChallenge(challenge) => {
                self.connection.on_pairing_challenge(&challenge);
            }
            TransportEvent::Opened(identity) => {
                self.connection.on_opened(&identity);
            }
            TransportEvent::Closed(reason) => match self.connection.on_closed(&reason) {
                RetryDecision::After(delay) => self.schedule_reconnect(delay),
                RetryDecision::Halt => {}
            },
            TransportEvent::Message(message) => self.route_inbound(&message),
            TransportEvent::CredentialsUpdated(material) => {
                if let Err(e) = self.connection.on_credentials_updated(&material) {
                    log::error!("[Watcher] failed to persist credentials: {e:#}");
                }
            }
        }
    }

    /// Classify and route one inbound message.
    fn route_inbound(&mut self, message: &InboundMessage) {
        match self.connection.classify(&message.sender) {
            Classification::SelfChat => {
                if self.router.suppress_echo(&message.id) {
                    log::debug!("[Watcher] suppressed echo of {}", message.id);
                    return;
                }
                let chat = self
                    .connection
                    .status()
                    .self_address
                    .clone()
                    .unwrap_or_else(|| "self".to_string());
                let active = self.registry.active().map(str::to_string);
                self.router.dispatch_self(
                    active.as_deref(),
                    QueuedMessage {
                        body: message.body.clone(),
                        timestamp: message.timestamp,
                        sender: None,
                    },
                    &chat,
                );
            }
            Classification::ThirdParty => self.router.dispatch_contact(message),
        }
    }

    async fn try_connect(&mut self) {
        match self.connection.connect().await {
            Ok(()) => {}
            Err(RetryDecision::After(delay)) => self.schedule_reconnect(delay),
            Err(RetryDecision::Halt) => {
                log::warn!("[Watcher] connection halted; waiting for trigger_login");
            }
        }
    }

    /// Arm a one-shot reconnect timer feeding back into the loop.
    fn schedule_reconnect(&self, delay: Duration) {
        let event_tx = self.event_sender();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(WatcherEvent::Reconnect);
        });
    }
}
