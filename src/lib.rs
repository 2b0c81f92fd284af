//! Courier - background messaging-network broker daemon.
//!
//! This crate provides the core functionality for the courier CLI: one
//! persistent connection to the remote messaging network, brokered to
//! many short-lived local clients over a Unix socket.
//!
//! # Architecture
//!
//! The crate follows a centralized state store pattern:
//!
//! - **Watcher** - Central orchestrator, owns state, runs event loop
//! - **ConnectionManager** - Upstream lifecycle, backoff, classification
//! - **SessionRegistry** - Named, de-duplicated client sessions
//! - **MessageRouter** - Queues, long-poll waiters, echo suppression
//! - **IpcServer** - Unix-socket line protocol for local clients
//!
//! # Modules
//!
//! - [`watcher`] - Event loop and request handlers
//! - [`connection`] - Upstream connection state machine
//! - [`ipc`] - Socket server and wire types
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod persist;
pub mod registry;
pub mod router;
pub mod speech;
pub mod terminal;
pub mod transport;
pub mod watcher;

// Re-export commonly used types
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::WatcherError;
pub use ipc::{IpcRequest, IpcResponse, IpcServer};
pub use registry::SessionRegistry;
pub use router::MessageRouter;

// Re-export the Watcher
pub use watcher::Watcher;
