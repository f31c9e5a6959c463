//! Per-file content hashes, persisted as a JSON sidecar under the index
//! directory. Loaded once, mutated in memory, flushed atomically on a
//! debounce and at shutdown. One instance covers code, a second covers
//! documentation files.

use crate::error::Result;
use crate::sync::atomic_write_json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

/// How long fingerprint changes may sit in memory before a flush.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(10);

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Streaming SHA-256 of a file on disk.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FingerprintDelta {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl FingerprintDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

pub struct FingerprintStore {
    path: PathBuf,
    map: BTreeMap<String, String>,
    dirty: bool,
    last_flush: Instant,
}

impl FingerprintStore {
    /// Loads the sidecar if present. A corrupt sidecar is treated as
    /// empty (the next reconcile rebuilds it) rather than blocking start.
    pub fn load(path: PathBuf) -> Self {
        let map = match std::fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<BTreeMap<String, String>>(&json) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "fingerprint sidecar unreadable, starting empty: {e}");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, map, dirty: false, last_flush: Instant::now() }
    }

    pub fn get(&self, relative_path: &str) -> Option<&str> {
        self.map.get(relative_path).map(|s| s.as_str())
    }

    pub fn has(&self, relative_path: &str) -> bool {
        self.map.contains_key(relative_path)
    }

    pub fn set(&mut self, relative_path: String, hash: String) {
        let changed = self.map.get(&relative_path) != Some(&hash);
        if changed {
            self.map.insert(relative_path, hash);
            self.dirty = true;
        }
    }

    pub fn delete(&mut self, relative_path: &str) -> bool {
        let removed = self.map.remove(relative_path).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.map.clone()
    }

    /// Classifies the on-disk state against the stored fingerprints.
    pub fn delta(&self, disk_hashes: &BTreeMap<String, String>) -> FingerprintDelta {
        let mut delta = FingerprintDelta::default();
        for (path, hash) in disk_hashes {
            match self.map.get(path) {
                None => delta.added.push(path.clone()),
                Some(stored) if stored != hash => delta.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.map.keys() {
            if !disk_hashes.contains_key(path) {
                delta.removed.push(path.clone());
            }
        }
        delta
    }

    /// Unconditional atomic flush.
    pub fn save(&mut self) -> Result<()> {
        atomic_write_json(&self.path, &self.map, false)?;
        self.dirty = false;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Debounced flush: writes only if dirty and the debounce interval
    /// has elapsed. Shutdown paths call `save` directly.
    pub fn save_if_due(&mut self) -> Result<()> {
        if self.dirty && self.last_flush.elapsed() >= FLUSH_DEBOUNCE {
            self.save()?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = FingerprintStore::load(dir.path().join("fp.json"));

        store.set("src/a.rs".into(), "abc".into());
        assert_eq!(store.get("src/a.rs"), Some("abc"));
        assert!(store.has("src/a.rs"));
        assert!(store.is_dirty());

        assert!(store.delete("src/a.rs"));
        assert!(!store.has("src/a.rs"));
        assert!(!store.delete("src/a.rs"));
    }

    #[test]
    fn save_persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fp.json");

        let mut store = FingerprintStore::load(path.clone());
        store.set("src/a.rs".into(), "h1".into());
        store.set("src/b.rs".into(), "h2".into());
        store.save().unwrap();
        assert!(!store.is_dirty());

        let reloaded = FingerprintStore::load(path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("src/b.rs"), Some("h2"));
    }

    #[test]
    fn corrupt_sidecar_starts_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fp.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FingerprintStore::load(path);
        assert!(store.is_empty());
    }

    #[test]
    fn delta_classifies_added_modified_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = FingerprintStore::load(dir.path().join("fp.json"));
        store.set("same.rs".into(), "s".into());
        store.set("changed.rs".into(), "old".into());
        store.set("gone.rs".into(), "g".into());

        let mut disk = BTreeMap::new();
        disk.insert("same.rs".to_string(), "s".to_string());
        disk.insert("changed.rs".to_string(), "new".to_string());
        disk.insert("fresh.rs".to_string(), "f".to_string());

        let delta = store.delta(&disk);
        assert_eq!(delta.added, vec!["fresh.rs"]);
        assert_eq!(delta.modified, vec!["changed.rs"]);
        assert_eq!(delta.removed, vec!["gone.rs"]);
        assert!(!delta.is_empty());
    }

    #[test]
    fn redundant_set_does_not_mark_dirty() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = FingerprintStore::load(dir.path().join("fp.json"));
        store.set("a".into(), "h".into());
        store.save().unwrap();
        store.set("a".into(), "h".into());
        assert!(!store.is_dirty());
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("x.txt");
        std::fs::write(&file, b"hello world").unwrap();
        assert_eq!(hash_file(&file).unwrap(), hash_bytes(b"hello world"));
    }
}
