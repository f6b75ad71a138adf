//! State store (C8): persistent JSON state with corruption recovery, plus
//! the in-memory last-value cache used for publish/broadcast dedupe.
//!
//! Generalizes `backend-rust/src/persistence.rs::load_state`/`save_state`
//! (itself read/fallback-to-default, non-atomic write) by adding the
//! atomic write (temp + rename) and corrupt-file quarantine spec §3/§4.8
//! require but the teacher's version doesn't implement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use crate::model::{Cover, CoverGroup, DryContact, Light, SensorDevice, UiConfig};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DevicesSection {
    pub lights: Vec<Light>,
    pub covers: Vec<Cover>,
    pub cover_groups: Vec<CoverGroup>,
    pub dry_contacts: Vec<DryContact>,
    pub temperatures: Vec<SensorDevice>,
    pub humidities: Vec<SensorDevice>,
    pub illuminances: Vec<SensorDevice>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub devices: DevicesSection,
    /// Last published state per `(kind, address)`, keyed as `"kind/address"`.
    pub states: HashMap<String, Value>,
    pub ui: UiConfig,
}

pub struct Store {
    path: PathBuf,
    last_value: RwLock<HashMap<String, Value>>,
}

fn quarantine_suffix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl Store {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_value: RwLock::new(HashMap::new()),
        }
    }

    /// Reads the persisted document. On a JSON decode failure, the file is
    /// renamed to `<name>.corrupt.<unix-ts>` and an empty document is
    /// returned — callers never see a hard error from a corrupt store.
    pub async fn read_raw(&self) -> PersistedDocument {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("store: could not read {}: {e}", self.path.display());
                }
                return PersistedDocument::default();
            }
        };

        match serde_json::from_str::<PersistedDocument>(&raw) {
            Ok(doc) => {
                *self.last_value.write().await = doc.states.clone();
                doc
            }
            Err(e) => {
                warn!("store: {} is corrupt ({e}), quarantining", self.path.display());
                self.quarantine().await;
                PersistedDocument::default()
            }
        }
    }

    async fn quarantine(&self) {
        let quarantined = self.path.with_extension(format!("json.corrupt.{}", quarantine_suffix()));
        if let Err(e) = fs::rename(&self.path, &quarantined).await {
            warn!("store: failed to quarantine corrupt file: {e}");
        }
    }

    /// Atomically writes the persisted document: write to a temp file,
    /// then rename over the target so readers never observe a partial write.
    pub async fn write(&self, doc: &PersistedDocument) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(doc).unwrap_or_else(|_| "{}".to_string());
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;
        *self.last_value.write().await = doc.states.clone();
        Ok(())
    }

    /// Returns true (and records the new value) if `value` differs from the
    /// cached last value for `key` — the single change-suppression check
    /// used by both the MQTT bridge and the realtime hub.
    pub async fn check_and_update(&self, key: &str, value: &Value) -> bool {
        let mut cache = self.last_value.write().await;
        if cache.get(key) == Some(value) {
            return false;
        }
        cache.insert(key.to_string(), value.clone());
        true
    }

    pub async fn snapshot_states(&self) -> HashMap<String, Value> {
        self.last_value.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile_shim::tempdir;

    // Minimal self-contained tempdir helper so this module doesn't need an
    // extra dev-dependency just for two tests.
    mod tempfile_shim {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempDir(pub PathBuf);
        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
        pub fn tempdir() -> TempDir {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!("buspro-bridge-store-test-{n}-{}", std::process::id()));
            std::fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_read_returns_empty() {
        let dir = tempdir();
        let path = dir.0.join("state.json");
        fs::write(&path, b"{not valid json").await.unwrap();

        let store = Store::new(&path);
        let doc = store.read_raw().await;
        assert!(doc.devices.lights.is_empty());

        let mut found_quarantine = false;
        let mut entries = fs::read_dir(&dir.0).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains("corrupt") {
                found_quarantine = true;
            }
        }
        assert!(found_quarantine);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir();
        let path = dir.0.join("state.json");
        let store = Store::new(&path);

        let mut doc = PersistedDocument::default();
        doc.states.insert("light/1/1/1".into(), json!({"on": true}));
        store.write(&doc).await.unwrap();

        let read_back = store.read_raw().await;
        assert_eq!(read_back.states.get("light/1/1/1"), Some(&json!({"on": true})));
    }

    #[tokio::test]
    async fn check_and_update_suppresses_duplicate_publish() {
        let dir = tempdir();
        let store = Store::new(dir.0.join("state.json"));
        let value = json!({"state": "ON"});
        assert!(store.check_and_update("light/1/1/1", &value).await);
        assert!(!store.check_and_update("light/1/1/1", &value).await);
    }
}
