//! Unix domain socket server for local client requests.
//!
//! Listens on a Unix socket and spawns one task per accepted connection.
//! Each connection carries a single newline-delimited JSON request; the
//! parsed request is forwarded to the watcher loop as
//! [`WatcherEvent::IpcRequest`] together with a oneshot reply channel.
//! The connection task writes whatever arrives on that channel back to
//! the client and closes. For `wait_for_message` the reply can take
//! minutes; if the client hangs up first, the task announces
//! [`WatcherEvent::ClientGone`] so the watcher can drop the waiter.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};

use super::protocol::{decode_request, encode_response, IpcResponse};
use crate::watcher::events::WatcherEvent;

/// Unix domain socket server for watcher IPC.
#[derive(Debug)]
pub struct IpcServer {
    /// Socket file path, unlinked on shutdown.
    socket_path: PathBuf,
    /// Accept loop task, aborted on shutdown.
    accept_handle: JoinHandle<()>,
}

impl IpcServer {
    /// Bind the socket and spawn the accept loop.
    ///
    /// A leftover socket file from a previous run is unlinked before
    /// binding, so a crashed watcher does not block the next one.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long for a `sockaddr_un` or
    /// the listener cannot be bound.
    pub fn start(
        socket_path: PathBuf,
        event_tx: UnboundedSender<WatcherEvent>,
    ) -> Result<Self> {
        // Smallest sun_path across the platforms we run on (macOS).
        const MAX_SOCKET_PATH: usize = 104;
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "socket path {} is too long: {path_len} bytes, limit is {}",
                socket_path.display(),
                MAX_SOCKET_PATH - 1
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("could not unlink old socket {}", socket_path.display())
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Bind through std so permissions are set before anything can
        // connect, then hand the listener to tokio.
        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("could not bind {}", socket_path.display()))?;

        // Owner-only: the socket grants full control of the account
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[IPC] Listening on {}", socket_path.display());

        let path_clone = socket_path.clone();
        let accept_handle = tokio::spawn(Self::accept_loop(listener, event_tx, path_clone));

        Ok(Self {
            socket_path,
            accept_handle,
        })
    }

    /// Accepts connections until aborted, one task per client.
    async fn accept_loop(
        listener: UnixListener,
        event_tx: UnboundedSender<WatcherEvent>,
        socket_path: PathBuf,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let conn_id = generate_conn_id();
                    log::debug!("[IPC] Client connected: {conn_id}");
                    tokio::spawn(handle_conn(conn_id, stream, event_tx.clone()));
                }
                Err(e) => {
                    // Socket file removed means we are shutting down
                    if !socket_path.exists() {
                        log::info!("[IPC] Socket file removed, stopping accept loop");
                        break;
                    }
                    log::error!("[IPC] Accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop the accept loop and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "[IPC] Failed to remove socket {}: {e}",
                    self.socket_path.display()
                );
            }
        }
    }

    /// Path to the socket file.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Per-connection task: read one request line, forward it to the watcher,
/// relay the reply, close.
async fn handle_conn(
    conn_id: String,
    stream: UnixStream,
    event_tx: UnboundedSender<WatcherEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(1024 * 1024));

    let line = match lines.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => {
            log::warn!("[IPC] {conn_id}: read error: {e}");
            let resp = IpcResponse::err(serde_json::Value::Null, format!("read error: {e}"));
            write_response(&mut write_half, &resp).await;
            return;
        }
        // Client connected and hung up without sending anything
        None => return,
    };

    let request = match decode_request(&line) {
        Ok(req) => req,
        Err(e) => {
            log::warn!("[IPC] {conn_id}: malformed request: {e}");
            let resp = IpcResponse::err(serde_json::Value::Null, e);
            write_response(&mut write_half, &resp).await;
            return;
        }
    };

    let request_id = request.id.clone();
    let (reply_tx, reply_rx) = oneshot::channel();
    if event_tx
        .send(WatcherEvent::IpcRequest {
            conn_id: conn_id.clone(),
            request,
            reply_tx,
        })
        .is_err()
    {
        let resp = IpcResponse::err(request_id, "watcher is shutting down");
        write_response(&mut write_half, &resp).await;
        return;
    }

    // Wait for the reply, but notice the client hanging up mid-poll so the
    // watcher can release any long-poll waiter it parked for us.
    tokio::select! {
        reply = reply_rx => {
            match reply {
                Ok(response) => write_response(&mut write_half, &response).await,
                Err(_) => {
                    // Watcher dropped the reply channel without answering
                    let resp = IpcResponse::err(request_id, "request dropped");
                    write_response(&mut write_half, &resp).await;
                }
            }
        }
        _ = lines.next() => {
            log::debug!("[IPC] {conn_id}: client disconnected before reply");
            let _ = event_tx.send(WatcherEvent::ClientGone { conn_id });
        }
    }
}

async fn write_response(write_half: &mut OwnedWriteHalf, response: &IpcResponse) {
    let line = encode_response(response);
    if let Err(e) = write_half.write_all(line.as_bytes()).await {
        log::debug!("[IPC] Failed to write response: {e}");
    }
    let _ = write_half.shutdown().await;
}

/// Generate a unique connection ID using a monotonic counter + random suffix.
fn generate_conn_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("ipc:{seq:x}{rand:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;

    async fn recv_request(
        rx: &mut mpsc::UnboundedReceiver<WatcherEvent>,
    ) -> (String, crate::ipc::protocol::IpcRequest, oneshot::Sender<IpcResponse>) {
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for request event")
            .expect("Channel closed");
        match event {
            WatcherEvent::IpcRequest {
                conn_id,
                request,
                reply_tx,
            } => (conn_id, request, reply_tx),
            other => panic!("Expected IpcRequest, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let server = IpcServer::start(sock_path.clone(), tx).unwrap();

        let mut stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
        stream
            .write_all(b"{\"id\": 1, \"method\": \"status\"}\n")
            .await
            .unwrap();

        let (conn_id, request, reply_tx) = recv_request(&mut rx).await;
        assert!(conn_id.starts_with("ipc:"));
        assert_eq!(request.method, "status");

        reply_tx
            .send(IpcResponse::ok(
                request.id,
                serde_json::json!({"connected": false}),
            ))
            .unwrap();

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["ok"], true);
        assert_eq!(value["result"]["connected"], false);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let (tx, _rx) = mpsc::unbounded_channel();

        let _server = IpcServer::start(sock_path.clone(), tx).unwrap();

        let mut stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["ok"], false);
        assert!(value["error"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_client_hangup_fires_client_gone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _server = IpcServer::start(sock_path.clone(), tx).unwrap();

        let mut stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
        stream
            .write_all(b"{\"method\": \"wait_for_message\", \"sessionId\": \"s1\"}\n")
            .await
            .unwrap();

        let (conn_id, _request, _reply_tx) = recv_request(&mut rx).await;

        // Hang up without waiting for a reply
        drop(stream);

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for ClientGone")
            .expect("Channel closed");
        match event {
            WatcherEvent::ClientGone { conn_id: gone } => assert_eq!(gone, conn_id),
            other => panic!("Expected ClientGone, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_unique_conn_ids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _server = IpcServer::start(sock_path.clone(), tx).unwrap();

        let mut streams = Vec::new();
        for _ in 0..3 {
            let mut stream = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
            stream
                .write_all(b"{\"method\": \"status\"}\n")
                .await
                .unwrap();
            streams.push(stream);
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (conn_id, _, _reply) = recv_request(&mut rx).await;
            ids.push(conn_id);
        }
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 3, "Conn IDs should be unique, got: {ids:?}");
    }

    #[tokio::test]
    async fn test_socket_path_length_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let long_name = "a".repeat(200);
        let sock_path = tmp.path().join(long_name).join("test.sock");

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = IpcServer::start(sock_path, tx);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("too long"),
            "Error should mention path too long: {err_msg}"
        );
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        std::fs::write(&sock_path, b"stale").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let server = IpcServer::start(sock_path.clone(), tx).unwrap();
        assert!(tokio::net::UnixStream::connect(&sock_path).await.is_ok());
        server.shutdown();
        assert!(!sock_path.exists());
    }
}
