//! Terminal-multiplexer automation collaborator.
//!
//! Window focus, keystroke injection, and session discovery are driven by
//! an external multiplexer. The watcher consumes it only through the
//! [`TerminalDriver`] trait; the bundled implementation shells out to
//! `tmux`. All calls go through `tokio::process` so collaborator latency
//! never blocks the event loop.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// One multiplexer session as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSession {
    /// Multiplexer-assigned id (e.g. tmux `$3`).
    pub id: String,
    /// Human-readable label (session name).
    pub label: String,
}

/// Narrow interface to the terminal multiplexer.
#[async_trait]
pub trait TerminalDriver: Send + Sync {
    /// Whether the given session id is still alive.
    async fn is_alive(&self, id: &str) -> bool;

    /// Snapshot of all live sessions.
    async fn list_sessions(&self) -> Result<Vec<TerminalSession>>;

    /// Type literal text into a session.
    async fn type_text(&self, id: &str, text: &str) -> Result<()>;

    /// Send a named keystroke (e.g. `Enter`, `C-c`) to a session.
    async fn send_keystroke(&self, id: &str, key: &str) -> Result<()>;

    /// Bring a session's window to the foreground.
    async fn focus(&self, id: &str) -> Result<()>;
}

/// `tmux`-backed driver.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    bin: String,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self {
            bin: "tmux".to_string(),
        }
    }
}

impl TmuxDriver {
    /// Driver using a specific tmux binary path.
    #[must_use]
    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {} {:?}", self.bin, args))?;
        if !output.status.success() {
            bail!(
                "{} {:?} failed: {}",
                self.bin,
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TerminalDriver for TmuxDriver {
    async fn is_alive(&self, id: &str) -> bool {
        self.run(&["has-session", "-t", id]).await.is_ok()
    }

    async fn list_sessions(&self) -> Result<Vec<TerminalSession>> {
        let out = self
            .run(&["list-sessions", "-F", "#{session_id}\t#{session_name}"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let (id, label) = line.split_once('\t')?;
                Some(TerminalSession {
                    id: id.to_string(),
                    label: label.to_string(),
                })
            })
            .collect())
    }

    async fn type_text(&self, id: &str, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", id, "-l", text]).await?;
        Ok(())
    }

    async fn send_keystroke(&self, id: &str, key: &str) -> Result<()> {
        self.run(&["send-keys", "-t", id, key]).await?;
        Ok(())
    }

    async fn focus(&self, id: &str) -> Result<()> {
        self.run(&["switch-client", "-t", id]).await?;
        Ok(())
    }
}
