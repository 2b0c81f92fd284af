//! Events consumed by the watcher loop.

use tokio::sync::oneshot;

use crate::ipc::protocol::{IpcRequest, IpcResponse};

/// Everything that can wake the watcher loop, other than transport traffic
/// (which arrives on its own channel as [`crate::transport::TransportEvent`]).
#[derive(Debug)]
pub enum WatcherEvent {
    /// A client sent a request over the socket. The connection task holds
    /// the other end of `reply_tx` and writes whatever we send there.
    IpcRequest {
        conn_id: String,
        request: IpcRequest,
        reply_tx: oneshot::Sender<IpcResponse>,
    },
    /// A client hung up before its reply was sent. Any long-poll waiter
    /// parked for this connection must be discarded.
    ClientGone { conn_id: String },
    /// A long-poll timer fired. Stale if the waiter was already resolved
    /// (`timer_id` no longer matches).
    WaitTimeout { session_id: String, timer_id: u64 },
    /// Backoff delay elapsed; attempt to reconnect the transport.
    Reconnect,
    /// Graceful shutdown (signal or internal request).
    Shutdown,
}
