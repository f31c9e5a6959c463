//! Content-addressed tree over files and their chunks. Equal root hashes
//! imply bit-identical indexable content, which makes restart-time drift
//! detection an O(1) compare; the diff pinpoints which chunks of a
//! modified file actually need re-embedding.

use crate::error::Result;
use crate::sync::atomic_write_json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileNode {
    pub relative_path: String,
    pub size: u64,
    pub mtime: u64,
    pub content_hash: String,
    /// Chunk content hashes in chunk order.
    pub chunk_hashes: Vec<String>,
    pub aggregate_hash: String,
}

impl FileNode {
    pub fn new(
        relative_path: String,
        size: u64,
        mtime: u64,
        content_hash: String,
        chunk_hashes: Vec<String>,
    ) -> Self {
        let mut parts: Vec<&str> = Vec::with_capacity(chunk_hashes.len() + 1);
        parts.push(&content_hash);
        parts.extend(chunk_hashes.iter().map(|h| h.as_str()));
        let aggregate_hash = sha256_hex(&parts);
        Self { relative_path, size, mtime, content_hash, chunk_hashes, aggregate_hash }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MerkleDiff {
    pub added_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub modified_files: Vec<String>,
    /// For each modified file, indices of chunks whose hash changed
    /// (including positions past the shorter side's length).
    pub chunk_changes: BTreeMap<String, Vec<usize>>,
}

impl MerkleDiff {
    pub fn is_empty(&self) -> bool {
        self.added_files.is_empty()
            && self.removed_files.is_empty()
            && self.modified_files.is_empty()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MerkleTree {
    files: BTreeMap<String, FileNode>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, node: FileNode) {
        self.files.insert(node.relative_path.clone(), node);
    }

    pub fn remove_file(&mut self, relative_path: &str) -> bool {
        self.files.remove(relative_path).is_some()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileNode> {
        self.files.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_chunks(&self) -> usize {
        self.files.values().map(|f| f.chunk_hashes.len()).sum()
    }

    /// Root over aggregate hashes in lexicographic path order (the map
    /// is ordered, so iteration order is the definition).
    pub fn root_hash(&self) -> String {
        let parts: Vec<&str> = self.files.values().map(|f| f.aggregate_hash.as_str()).collect();
        sha256_hex(&parts)
    }

    /// O(1) equality via root compare.
    pub fn has_changed(&self, other: &MerkleTree) -> bool {
        self.root_hash() != other.root_hash()
    }

    /// Difference from `other` (the older tree) to `self` (the newer).
    pub fn diff(&self, other: &MerkleTree) -> MerkleDiff {
        let mut diff = MerkleDiff::default();
        for (path, node) in &self.files {
            match other.files.get(path) {
                None => diff.added_files.push(path.clone()),
                Some(old) if old.aggregate_hash != node.aggregate_hash => {
                    diff.modified_files.push(path.clone());
                    let longest = node.chunk_hashes.len().max(old.chunk_hashes.len());
                    let changed: Vec<usize> = (0..longest)
                        .filter(|i| node.chunk_hashes.get(*i) != old.chunk_hashes.get(*i))
                        .collect();
                    diff.chunk_changes.insert(path.clone(), changed);
                }
                Some(_) => {}
            }
        }
        for path in other.files.keys() {
            if !self.files.contains_key(path) {
                diff.removed_files.push(path.clone());
            }
        }
        diff
    }

    pub fn snapshot(&self) -> MerkleTree {
        self.clone()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, false)
    }

    /// Missing or corrupt snapshots load as an empty tree; the integrity
    /// pass treats that as full drift and rebuilds.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(path = %path.display(), "merkle snapshot unreadable, starting empty: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}
