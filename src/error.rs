//! Error taxonomy for the watcher.
//!
//! Connection-level failures never cross the IPC boundary as errors — they
//! land in [`crate::connection::ConnectionStatus`] and are observed on the
//! next `status` call. Handler-level errors are caught at the dispatch
//! boundary and serialized as `{ok: false, error}`. A long-poll timeout is
//! not an error at all; it is an empty successful result.

use thiserror::Error;

/// Classified failure raised by IPC handlers and the connection layer.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Transient upstream failure — retried via backoff, never fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credentials were invalidated remotely. Only an explicit
    /// `trigger_login` resumes the connection.
    #[error("authentication invalidated; run trigger_login to re-pair")]
    AuthInvalidated,

    /// The remote network handed the session to another process.
    #[error("session replaced by another connection")]
    SessionReplaced,

    /// Malformed IPC request — error response, connection closed.
    #[error("protocol error: {0}")]
    IpcProtocol(String),

    /// Missing file, recipient, or session named by a request.
    #[error("unknown target: {0}")]
    UnknownTarget(String),
}
