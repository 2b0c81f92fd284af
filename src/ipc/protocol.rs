//! Wire types for the local IPC protocol.
//!
//! Newline-delimited JSON over a Unix domain socket. Each client writes
//! exactly one request object and reads exactly one response object:
//!
//! ```text
//! → {"id": 1, "sessionId": "abc", "method": "drain_queue", "params": {}}
//! ← {"id": 1, "ok": true, "result": []}
//! ```
//!
//! The connection closes after the response, except `wait_for_message`,
//! which holds the connection open until the long-poll resolves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WatcherError;

/// One request object, parsed from a single line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Caller-chosen correlation id, echoed back verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    /// Opaque client session key. Optional for session-less methods.
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    /// Method name, snake_case.
    pub method: String,
    /// Method parameters; `{}` when absent.
    #[serde(default)]
    pub params: Value,
}

/// One response object, written as a single line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Correlation id from the request.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    /// Whether the request succeeded. A long-poll timeout is `ok: true`
    /// with an empty result.
    pub ok: bool,
    /// Method result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    /// Successful response carrying `result`.
    #[must_use]
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response carrying an error message.
    #[must_use]
    pub fn err(id: Value, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Every operation the watcher exposes over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Register,
    Rename,
    Status,
    SendText,
    SendFile,
    DrainQueue,
    WaitForMessage,
    TriggerLogin,
    ListContacts,
    ListChats,
    FetchHistory,
    SendVoice,
    Speak,
    GetVoiceConfig,
    SetVoiceConfig,
    ListSessions,
    SwitchSession,
    EndSession,
    RediscoverSessions,
}

impl std::str::FromStr for Method {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "register" => Self::Register,
            "rename" => Self::Rename,
            "status" => Self::Status,
            "send_text" => Self::SendText,
            "send_file" => Self::SendFile,
            "drain_queue" => Self::DrainQueue,
            "wait_for_message" => Self::WaitForMessage,
            "trigger_login" => Self::TriggerLogin,
            "list_contacts" => Self::ListContacts,
            "list_chats" => Self::ListChats,
            "fetch_history" => Self::FetchHistory,
            "send_voice" => Self::SendVoice,
            "speak" => Self::Speak,
            "get_voice_config" => Self::GetVoiceConfig,
            "set_voice_config" => Self::SetVoiceConfig,
            "list_sessions" => Self::ListSessions,
            "switch_session" => Self::SwitchSession,
            "end_session" => Self::EndSession,
            "rediscover_sessions" => Self::RediscoverSessions,
            other => {
                return Err(WatcherError::IpcProtocol(format!(
                    "unknown method: {other}"
                )))
            }
        })
    }
}

/// Parse one request line.
pub fn decode_request(line: &str) -> Result<IpcRequest, WatcherError> {
    serde_json::from_str(line).map_err(|e| WatcherError::IpcProtocol(e.to_string()))
}

/// Encode a response as one newline-terminated line.
#[must_use]
pub fn encode_response(response: &IpcResponse) -> String {
    // IpcResponse has no map keys that can fail to serialize.
    let mut line = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"ok":false,"error":"response serialization failed"}"#.to_string()
    });
    line.push('\n');
    line
}
