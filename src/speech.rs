//! Text-to-speech collaborator.
//!
//! Synthesis and local playback run in an external speech program behind
//! the [`SpeechSynth`] trait; the bundled implementation drives the
//! platform `say` command. Voice settings are a small persisted value the
//! IPC layer can read and write.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Persisted voice settings for synthesis and playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Voice name understood by the speech program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Speaking rate in words per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    /// Master switch; when off, voice requests fail fast.
    pub enabled: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: None,
            rate: None,
            enabled: true,
        }
    }
}

/// Narrow interface to the speech program.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Synthesize `text` to an audio file and return its path.
    async fn synthesize(&self, text: &str, config: &VoiceConfig) -> Result<PathBuf>;

    /// Speak `text` on the local audio device.
    async fn speak(&self, text: &str, config: &VoiceConfig) -> Result<()>;
}

/// `say`-backed synthesizer.
#[derive(Debug, Clone)]
pub struct SayCommand {
    bin: String,
    out_dir: PathBuf,
}

impl Default for SayCommand {
    fn default() -> Self {
        Self {
            bin: "say".to_string(),
            out_dir: std::env::temp_dir(),
        }
    }
}

impl SayCommand {
    fn base_args(config: &VoiceConfig) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref voice) = config.voice {
            args.push("-v".to_string());
            args.push(voice.clone());
        }
        if let Some(rate) = config.rate {
            args.push("-r".to_string());
            args.push(rate.to_string());
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {}", self.bin))?;
        if !output.status.success() {
            bail!(
                "{} failed: {}",
                self.bin,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynth for SayCommand {
    async fn synthesize(&self, text: &str, config: &VoiceConfig) -> Result<PathBuf> {
        if !config.enabled {
            bail!("voice synthesis is disabled");
        }
        let path = self
            .out_dir
            .join(format!("courier-voice-{}.aiff", uuid::Uuid::new_v4()));
        let mut args = Self::base_args(config);
        args.push("-o".to_string());
        args.push(path.to_string_lossy().into_owned());
        args.push(text.to_string());
        self.run(&args).await?;
        Ok(path)
    }

    async fn speak(&self, text: &str, config: &VoiceConfig) -> Result<()> {
        if !config.enabled {
            bail!("voice synthesis is disabled");
        }
        let mut args = Self::base_args(config);
        args.push(text.to_string());
        self.run(&args).await
    }
}
