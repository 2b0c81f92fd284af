//! IPC request dispatch.
//!
//! Every request lands here from the event loop with a oneshot reply
//! channel back to the connection task. Handlers run to completion on
//! the loop; the only deferred reply is `wait_for_message`, whose reply
//! channel is parked in the router as a waiter.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::config::{DEFAULT_WAIT_TIMEOUT_MS, MAX_WAIT_TIMEOUT_MS};
use crate::error::WatcherError;
use crate::identity;
use crate::ipc::protocol::{IpcRequest, IpcResponse, Method};
use crate::registry::SessionOrigin;
use crate::router::QueuedMessage;
use crate::transport::OutboundPayload;
use crate::watcher::events::WatcherEvent;
use crate::watcher::Watcher;

/// Name given to sessions created implicitly by a session-scoped request.
const AUTO_REGISTER_NAME: &str = "session";

impl Watcher {
    /// Dispatch one IPC request. Replies on `reply_tx` except for a
    /// parked long-poll.
    pub(crate) async fn handle_ipc(
        &mut self,
        conn_id: String,
        request: IpcRequest,
        reply_tx: oneshot::Sender<IpcResponse>,
    ) {
        let method = match Method::from_str(&request.method) {
            Ok(method) => method,
            Err(e) => {
                let _ = reply_tx.send(IpcResponse::err(request.id, e));
                return;
            }
        };
        log::debug!("[Watcher] {conn_id}: {}", request.method);

        // Any session-bearing request implies the session exists; pick up
        // sessions that skipped register (or outlived a registry wipe).
        if method != Method::Register {
            if let Some(session_id) = request.session_id.clone() {
                self.ensure_session(&session_id);
            }
        }

        // Long-poll parks its reply channel instead of answering inline.
        if method == Method::WaitForMessage {
            self.handle_wait(&conn_id, request, reply_tx);
            return;
        }

        let result = self.dispatch(method, &request).await;
        let response = match result {
            Ok(value) => IpcResponse::ok(request.id, value),
            Err(e) => IpcResponse::err(request.id, format!("{e:#}")),
        };
        let _ = reply_tx.send(response);
    }

    async fn dispatch(&mut self, method: Method, request: &IpcRequest) -> Result<Value> {
        match method {
            Method::Register => self.op_register(request),
            Method::Rename => self.op_rename(request),
            Method::Status => Ok(self.op_status()),
            Method::SendText => self.op_send_text(request).await,
            Method::SendFile => self.op_send_file(request).await,
            Method::DrainQueue => self.op_drain_queue(request),
            Method::TriggerLogin => Ok(self.op_trigger_login().await),
            Method::ListContacts => Ok(serde_json::to_value(self.router.list_contacts())?),
            Method::ListChats => Ok(self.op_list_chats()),
            Method::FetchHistory => self.op_fetch_history(request),
            Method::SendVoice => self.op_send_voice(request).await,
            Method::Speak => self.op_speak(request).await,
            Method::GetVoiceConfig => Ok(serde_json::to_value(&self.voice)?),
            Method::SetVoiceConfig => self.op_set_voice_config(request),
            Method::ListSessions => Ok(self.op_list_sessions()),
            Method::SwitchSession => self.op_switch_session(request).await,
            Method::EndSession => self.op_end_session(request),
            Method::RediscoverSessions => self.op_rediscover().await,
            // Handled before dispatch.
            Method::WaitForMessage => unreachable!("wait_for_message is deferred"),
        }
    }

    // ─── Session lifecycle ─────────────────────────────────────────────────

    fn op_register(&mut self, request: &IpcRequest) -> Result<Value> {
        let session_id = required_session(request)?;
        let proposed = request.params["name"]
            .as_str()
            .unwrap_or(AUTO_REGISTER_NAME);
        let terminal = request.params["terminal"].as_str().map(str::to_string);
        let name = self
            .registry
            .register(session_id, proposed, terminal, SessionOrigin::Registered);
        self.persist_registry();
        log::info!("[Watcher] registered session {session_id} as {name:?}");
        Ok(json!({
            "sessionId": session_id,
            "name": name,
            "active": self.registry.active() == Some(session_id),
        }))
    }

    fn op_rename(&mut self, request: &IpcRequest) -> Result<Value> {
        let session_id = required_session(request)?;
        let new_name = request.params["name"]
            .as_str()
            .context("missing param: name")?;
        let name = self
            .registry
            .rename(session_id, new_name)
            .context("session vanished during rename")?;
        self.persist_registry();
        Ok(json!({ "name": name }))
    }

    fn op_list_sessions(&self) -> Value {
        let active = self.registry.active();
        let sessions: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|s| {
                json!({
                    "sessionId": s.session_id,
                    "name": s.name,
                    "terminal": s.terminal,
                    "origin": s.origin,
                    "registeredAt": s.registered_at,
                    "active": active == Some(s.session_id.as_str()),
                })
            })
            .collect();
        Value::Array(sessions)
    }

    async fn op_switch_session(&mut self, request: &IpcRequest) -> Result<Value> {
        let target = request.params["target"]
            .as_str()
            .context("missing param: target")?;
        if !self.registry.switch(target) {
            return Err(WatcherError::UnknownTarget(target.to_string()).into());
        }
        self.persist_registry();

        // Bring the bound terminal window forward; a focus failure does
        // not undo the switch.
        let terminal = self
            .registry
            .active()
            .and_then(|id| self.registry.get(id))
            .and_then(|s| s.terminal.clone());
        if let Some(ref term) = terminal {
            if let Err(e) = self.terminal.focus(term).await {
                log::warn!("[Watcher] failed to focus terminal {term}: {e:#}");
            }
        }
        let active = self.registry.active().map(str::to_string);
        Ok(json!({ "active": active }))
    }

    fn op_end_session(&mut self, request: &IpcRequest) -> Result<Value> {
        let target = request.params["target"]
            .as_str()
            .or(request.session_id.as_deref())
            .context("missing param: target")?;
        let session_id = self
            .registry
            .resolve(target)
            .ok_or_else(|| WatcherError::UnknownTarget(target.to_string()))?;
        self.registry.end(&session_id);
        self.router.remove_session(&session_id);
        self.persist_registry();
        log::info!("[Watcher] ended session {session_id}");
        Ok(json!({ "ended": session_id }))
    }

    async fn op_rediscover(&mut self) -> Result<Value> {
        let snapshot = self.terminal.list_sessions().await?;
        let live = snapshot.iter().map(|t| t.id.clone()).collect();

        let removed = self.registry.prune_dead(&live);
        for id in &removed {
            self.router.remove_session(id);
        }
        let added = self.registry.discover(&snapshot);
        self.persist_registry();
        log::info!(
            "[Watcher] rediscover: {} pruned, {} discovered",
            removed.len(),
            added.len()
        );
        Ok(json!({ "removed": removed, "added": added }))
    }

    // ─── Status & connection ───────────────────────────────────────────────

    fn op_status(&self) -> Value {
        let mut status = serde_json::to_value(self.connection.status())
            .unwrap_or_else(|_| json!({}));
        if let Some(obj) = status.as_object_mut() {
            obj.insert("sessions".into(), json!(self.registry.len()));
            let active_name = self
                .registry
                .active()
                .and_then(|id| self.registry.get(id))
                .map(|s| s.name.clone());
            obj.insert("activeSession".into(), json!(active_name));
        }
        status
    }

    async fn op_trigger_login(&mut self) -> Value {
        self.connection.trigger_login().await;
        // Reconnect immediately; the fresh open produces a pairing
        // challenge when no valid credentials exist.
        let _ = self.event_sender().send(WatcherEvent::Reconnect);
        json!({ "loginTriggered": true })
    }

    // ─── Messaging ─────────────────────────────────────────────────────────

    async fn op_send_text(&mut self, request: &IpcRequest) -> Result<Value> {
        let body = request.params["body"]
            .as_str()
            .context("missing param: body")?;
        let target = self.resolve_target(request.params["to"].as_str())?;
        let receipt = self
            .connection
            .send(&target, OutboundPayload::Text(body.to_string()))
            .await?;
        self.router.note_sent(&receipt.message_id);
        Ok(json!({ "messageId": receipt.message_id, "to": target }))
    }

    async fn op_send_file(&mut self, request: &IpcRequest) -> Result<Value> {
        let path = PathBuf::from(
            request.params["path"]
                .as_str()
                .context("missing param: path")?,
        );
        if !path.is_file() {
            anyhow::bail!("no such file: {}", path.display());
        }
        let target = self.resolve_target(request.params["to"].as_str())?;
        let receipt = self
            .connection
            .send(&target, OutboundPayload::File(path))
            .await?;
        self.router.note_sent(&receipt.message_id);
        Ok(json!({ "messageId": receipt.message_id, "to": target }))
    }

    async fn op_send_voice(&mut self, request: &IpcRequest) -> Result<Value> {
        let text = request.params["text"]
            .as_str()
            .context("missing param: text")?;
        let target = self.resolve_target(request.params["to"].as_str())?;
        let audio = self.speech.synthesize(text, &self.voice).await?;
        let receipt = self
            .connection
            .send(&target, OutboundPayload::Voice(audio))
            .await?;
        self.router.note_sent(&receipt.message_id);
        Ok(json!({ "messageId": receipt.message_id, "to": target }))
    }

    async fn op_speak(&mut self, request: &IpcRequest) -> Result<Value> {
        let text = request.params["text"]
            .as_str()
            .context("missing param: text")?;
        self.speech.speak(text, &self.voice).await?;
        Ok(json!({ "spoken": true }))
    }

    fn op_drain_queue(&mut self, request: &IpcRequest) -> Result<Value> {
        let session_id = required_session(request)?.to_string();
        let messages = if let Some(contact) = request.params["contact"].as_str() {
            self.router.drain_contact(contact)
        } else if request.params["all"].as_bool() == Some(true) {
            self.router.drain_all(&session_id)
        } else {
            self.router.drain_self(&session_id)
        };
        Ok(serde_json::to_value(messages)?)
    }

    fn op_list_chats(&self) -> Value {
        let self_address = self.connection.status().self_address.clone();
        let chats = self
            .router
            .list_chats(self_address.as_deref(), self.registry.active());
        serde_json::to_value(chats).unwrap_or_else(|_| json!([]))
    }

    fn op_fetch_history(&mut self, request: &IpcRequest) -> Result<Value> {
        let chat = match request.params["chat"].as_str() {
            Some(chat) => chat.to_string(),
            None => self
                .connection
                .status()
                .self_address
                .clone()
                .context("not connected and no chat given")?,
        };
        let limit = request.params["limit"]
            .as_u64()
            .map_or(self.config.history_limit, |l| l as usize);
        Ok(serde_json::to_value(self.router.history(&chat, limit))?)
    }

    fn op_set_voice_config(&mut self, request: &IpcRequest) -> Result<Value> {
        // Partial update: absent fields keep their current value.
        if let Some(voice) = request.params.get("voice") {
            self.voice.voice = voice.as_str().map(str::to_string);
        }
        if let Some(rate) = request.params.get("rate") {
            self.voice.rate = rate.as_u64().map(|r| r as u32);
        }
        if let Some(enabled) = request.params["enabled"].as_bool() {
            self.voice.enabled = enabled;
        }
        self.persist_caches();
        Ok(serde_json::to_value(&self.voice)?)
    }

    // ─── Long poll ─────────────────────────────────────────────────────────

    fn handle_wait(
        &mut self,
        conn_id: &str,
        request: IpcRequest,
        reply_tx: oneshot::Sender<IpcResponse>,
    ) {
        let Some(session_id) = request.session_id.clone() else {
            let _ = reply_tx.send(IpcResponse::err(request.id, "missing sessionId"));
            return;
        };

        // Anything already queued resolves the poll without parking.
        if self.router.has_pending(&session_id) {
            let batch = self.router.drain_self(&session_id);
            let _ = reply_tx.send(batch_response(request.id, &batch));
            return;
        }

        let timeout_ms = request.params["timeout_ms"]
            .as_u64()
            .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS)
            .min(MAX_WAIT_TIMEOUT_MS);

        let (batch_tx, batch_rx) = oneshot::channel::<Vec<QueuedMessage>>();
        let timer_id = self.router.register_waiter(&session_id, conn_id, batch_tx);

        // Bridge the router's batch channel to the connection's reply
        // channel off-loop.
        let request_id = request.id;
        tokio::spawn(async move {
            if let Ok(batch) = batch_rx.await {
                let _ = reply_tx.send(batch_response(request_id, &batch));
            }
            // Sender dropped: waiter removed on client disconnect,
            // nobody is listening anymore.
        });

        let event_tx = self.event_sender();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            let _ = event_tx.send(WatcherEvent::WaitTimeout {
                session_id,
                timer_id,
            });
        });
    }

    // ─── Helpers ───────────────────────────────────────────────────────────

    /// Implicitly register an unknown session id so session-scoped
    /// methods work without a prior `register`.
    fn ensure_session(&mut self, session_id: &str) {
        if self.registry.contains(session_id) {
            return;
        }
        let name = self.registry.register(
            session_id,
            AUTO_REGISTER_NAME,
            None,
            SessionOrigin::Registered,
        );
        self.persist_registry();
        log::info!("[Watcher] auto-registered session {session_id} as {name:?}");
    }

    /// Resolve a send target: a raw identity is normalized and used as
    /// is, a display name goes through the contact directory, and no
    /// target means the self chat.
    fn resolve_target(&self, to: Option<&str>) -> Result<String> {
        match to {
            Some(target) if target.contains('@') => Ok(identity::normalize(target)),
            Some(target) => self
                .router
                .resolve_contact(target)
                .ok_or_else(|| WatcherError::UnknownTarget(target.to_string()).into()),
            None => self
                .connection
                .status()
                .self_address
                .clone()
                .context("not connected, self chat unavailable"),
        }
    }
}

fn required_session(request: &IpcRequest) -> Result<&str> {
    request
        .session_id
        .as_deref()
        .context("missing sessionId")
}

fn batch_response(id: Value, batch: &[QueuedMessage]) -> IpcResponse {
    match serde_json::to_value(batch) {
        Ok(value) => IpcResponse::ok(id, value),
        Err(e) => IpcResponse::err(id, e),
    }
}
