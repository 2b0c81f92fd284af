//! Courier CLI - background watcher daemon for a messaging network.
//!
//! This is the main binary entry point. See the `courier` library for
//! the core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use courier::speech::SayCommand;
use courier::terminal::TmuxDriver;
use courier::transport::LoopbackTransport;
use courier::watcher::WatcherEvent;
use courier::{Config, Watcher};

#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Background watcher brokering one messaging-network connection to local clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watcher daemon (default).
    Run,
    /// Query a running watcher for its connection status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon().await,
        Commands::Status => query_status().await,
    }
}

async fn run_daemon() -> Result<()> {
    let config = Config::load()?;
    let watcher = Watcher::new(
        config,
        Arc::new(LoopbackTransport),
        Box::new(TmuxDriver::default()),
        Box::new(SayCommand::default()),
    )?;

    // Signals feed the loop like everything else; the loop flushes
    // state and removes the socket before returning.
    let event_tx = watcher.event_sender();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("Signal received, shutting down");
        let _ = event_tx.send(WatcherEvent::Shutdown);
    });

    log::info!("Courier v{} starting", env!("CARGO_PKG_VERSION"));
    watcher.run().await
}

/// One-shot status query over the daemon's socket.
async fn query_status() -> Result<()> {
    let config = Config::load()?;
    let socket_path = config.socket_path()?;
    let mut stream = tokio::net::UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("is the watcher running? ({})", socket_path.display()))?;

    stream.write_all(b"{\"method\": \"status\"}\n").await?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await?;
    let response: serde_json::Value =
        serde_json::from_str(line.trim()).context("malformed status response")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
