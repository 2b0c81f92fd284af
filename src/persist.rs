//! File-backed persistence for the registry and caches.
//!
//! Small synchronous JSON files in the config directory. The registry is
//! written after every mutation; the caches (contact directory, voice
//! settings) hold only anchor data — never message history.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::RegistrySnapshot;
use crate::router::ContactEntry;
use crate::speech::VoiceConfig;

/// Persisted caches: contact directory and voice settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Caches {
    /// Contact directory, most recent first.
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,
    /// Voice settings.
    #[serde(default)]
    pub voice: VoiceConfig,
}

/// Store rooted at a directory.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Store under `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create store dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join("registry.json")
    }

    fn caches_path(&self) -> PathBuf {
        self.dir.join("caches.json")
    }

    /// Load the registry snapshot; a missing file yields an empty registry.
    pub fn load_registry(&self) -> Result<RegistrySnapshot> {
        load_json(&self.registry_path())
    }

    /// Persist the registry snapshot.
    pub fn save_registry(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        save_json(&self.registry_path(), snapshot)
    }

    /// Load the caches; a missing file yields defaults.
    pub fn load_caches(&self) -> Result<Caches> {
        load_json(&self.caches_path())
    }

    /// Persist the caches.
    pub fn save_caches(&self, caches: &Caches) -> Result<()> {
        save_json(&self.caches_path(), caches)
    }
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Write via a temp file + rename so a crash mid-write never leaves a
/// truncated registry on disk.
fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SessionOrigin, SessionRegistry};

    #[test]
    fn test_missing_files_yield_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.load_registry().unwrap().sessions.is_empty());
        assert!(store.load_caches().unwrap().contacts.is_empty());
    }

    #[test]
    fn test_registry_survives_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut registry = SessionRegistry::new();
        registry.register("a", "Dev", Some("%1".into()), SessionOrigin::Registered);
        registry.register("b", "Dev", Some("%2".into()), SessionOrigin::Registered);
        store.save_registry(&registry.snapshot()).unwrap();

        let reloaded = SessionRegistry::from_snapshot(store.load_registry().unwrap());
        assert_eq!(reloaded.len(), 2);
        let names: Vec<&str> = reloaded.list().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Dev", "Dev (2)"]);
    }

    #[test]
    fn test_caches_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let caches = Caches {
            contacts: vec![ContactEntry {
                identity: "x@s.net".to_string(),
                name: Some("Ada".to_string()),
                last_seen: chrono::Utc::now(),
            }],
            voice: VoiceConfig {
                voice: Some("Samantha".to_string()),
                rate: None,
                enabled: true,
            },
        };
        store.save_caches(&caches).unwrap();

        let back = store.load_caches().unwrap();
        assert_eq!(back.contacts.len(), 1);
        assert_eq!(back.voice.voice.as_deref(), Some("Samantha"));
    }
}
