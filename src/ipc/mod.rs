//! Local IPC: newline-delimited JSON over a Unix domain socket.

pub mod protocol;
pub mod server;

pub use protocol::{IpcRequest, IpcResponse, Method};
pub use server::IpcServer;
