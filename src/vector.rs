//! Disk-backed vector table: usearch HNSW index (cosine over unit
//! vectors) plus a JSON chunk sidecar. Single writer per store; every
//! operation goes through the store's async mutex, so reads and writes
//! never interleave at the storage layer. Searches across *different*
//! stores run concurrently.

use crate::chunker::Chunk;
use crate::config;
use crate::error::{Error, Result};
use crate::paths::compile_path_pattern;
use crate::sync::{AsyncMutex, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

const INDEX_FILE: &str = "index.usearch";
const CHUNKS_FILE: &str = "chunks.json";
const LOCK_FILE: &str = ".lock";

/// Locks older than this are considered leftovers from a dead process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(5 * 60);

const INITIAL_CAPACITY: usize = 65_536;

/// Over-fetch multiplier when a filter discards candidates post-KNN.
const FILTER_FETCH_FACTOR: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub path: String,
    pub text: String,
    pub score: f32,
    pub start_line: usize,
    pub end_line: usize,
}

/// Filter over chunk metadata applied after KNN. String values pass
/// through the escape chokepoints below before reaching any predicate
/// representation.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub path_prefix: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, relative_path: &str) -> bool {
        match &self.path_prefix {
            Some(prefix) => relative_path.starts_with(prefix.as_str()),
            None => true,
        }
    }

    /// SQL-shaped rendering of the predicate, for logs and wire
    /// compatibility. Values are escaped at the chokepoint.
    pub fn predicate(&self) -> Option<String> {
        self.path_prefix.as_ref().map(|prefix| {
            format!(
                "relative_path LIKE '{}%'",
                escape_like_pattern(&escape_filter_string(prefix))
            )
        })
    }
}

/// Escapes a string value for use inside a quoted predicate: backslash,
/// single quote, NUL, and control characters.
pub fn escape_filter_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("''"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Additionally escapes LIKE wildcards for values used inside patterns.
pub fn escape_like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '[' => out.push_str("\\["),
            c => out.push(c),
        }
    }
    out
}

#[derive(Serialize, Deserialize, Default)]
struct ChunkSidecar {
    next_key: u64,
    chunks: HashMap<u64, Chunk>,
}

struct VectorState {
    index: usearch::Index,
    chunks: HashMap<u64, Chunk>,
    next_key: u64,
}

pub struct VectorStore {
    dir: PathBuf,
    dimension: usize,
    state: AsyncMutex<VectorState>,
}

fn index_options(dimension: usize) -> IndexOptions {
    IndexOptions {
        dimensions: dimension,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F16,
        connectivity: 16,
        expansion_add: 128,
        expansion_search: 64,
        multi: false,
    }
}

/// Removes a leftover lock older than five minutes. A probe file opened
/// with `create_new` arbitrates so two starters cannot both reap and
/// proceed.
fn reap_stale_lock(dir: &Path) {
    let lock = dir.join(LOCK_FILE);
    let Ok(meta) = std::fs::metadata(&lock) else { return };
    let age = meta.modified().ok().and_then(|m| m.elapsed().ok());
    if age.is_none_or(|a| a < STALE_LOCK_AGE) {
        return;
    }
    let probe = dir.join(".lock.reap");
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            warn!(path = %lock.display(), "removing stale vector store lock");
            let _ = std::fs::remove_file(&lock);
            let _ = std::fs::remove_file(&probe);
        }
        Err(_) => debug!("another process is reaping the stale lock"),
    }
}

impl VectorStore {
    pub async fn open(dir: PathBuf, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        reap_stale_lock(&dir);

        let lock = dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut f) => {
                use std::io::Write;
                let _ = write!(f, "{}", std::process::id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %lock.display(), "vector store lock already present, continuing");
            }
            Err(e) => return Err(e.into()),
        }

        let index = usearch::Index::new(&index_options(dimension))
            .map_err(|e| Error::Internal(format!("vector index init: {e}")))?;

        let index_path = dir.join(INDEX_FILE);
        let chunks_path = dir.join(CHUNKS_FILE);
        let (chunks, next_key) = if index_path.exists() && chunks_path.exists() {
            index
                .load(index_path.to_string_lossy().as_ref())
                .map_err(|e| Error::IndexCorrupt(format!("vector index load: {e}")))?;
            let json = std::fs::read_to_string(&chunks_path)?;
            let sidecar: ChunkSidecar = serde_json::from_str(&json)
                .map_err(|e| Error::IndexCorrupt(format!("vector sidecar: {e}")))?;
            if index.size() != sidecar.chunks.len() {
                return Err(Error::IndexCorrupt(format!(
                    "vector index holds {} entries but sidecar has {}",
                    index.size(),
                    sidecar.chunks.len()
                )));
            }
            (sidecar.chunks, sidecar.next_key)
        } else {
            index
                .reserve(INITIAL_CAPACITY)
                .map_err(|e| Error::Internal(format!("vector index reserve: {e}")))?;
            (HashMap::new(), 0)
        };

        Ok(Self {
            dir,
            dimension,
            state: AsyncMutex::new(VectorState { index, chunks, next_key }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn len(&self) -> usize {
        self.state.acquire().await.chunks.len()
    }

    /// Inserts a batch of (chunk, vector) pairs and persists both the
    /// index and the sidecar. The batch is atomic with respect to the
    /// on-disk state: a crash leaves the previous files in place.
    pub async fn insert_chunks(&self, records: Vec<(Chunk, Vec<f32>)>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.acquire().await;

        let needed = state.chunks.len() + records.len();
        if needed >= state.index.capacity() {
            state
                .index
                .reserve((needed * 2).max(INITIAL_CAPACITY))
                .map_err(|e| Error::Internal(format!("vector index reserve: {e}")))?;
        }

        let mut inserted = 0usize;
        for (chunk, vector) in records {
            if vector.len() != self.dimension {
                return Err(Error::Internal(format!(
                    "vector dimension {} does not match store dimension {}",
                    vector.len(),
                    self.dimension
                )));
            }
            let key = state.next_key;
            state.next_key += 1;
            state
                .index
                .add(key, &vector)
                .map_err(|e| Error::Internal(format!("vector add: {e}")))?;
            state.chunks.insert(key, chunk);
            inserted += 1;
        }

        self.persist(&state)?;
        Ok(inserted)
    }

    /// Removes every chunk stored for a relative path. Returns how many
    /// were removed; zero removals skip the disk write.
    pub async fn delete_by_path(&self, relative_path: &str) -> Result<usize> {
        let mut state = self.state.acquire().await;
        let keys: Vec<u64> = state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.relative_path == relative_path)
            .map(|(key, _)| *key)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        for key in &keys {
            state
                .index
                .remove(*key)
                .map_err(|e| Error::Internal(format!("vector remove: {e}")))?;
            state.chunks.remove(key);
        }
        self.persist(&state)?;
        Ok(keys.len())
    }

    /// KNN over the stored vectors; scores are cosine similarity clamped
    /// to [0, 1], 1.0 meaning an exact match.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(Error::InvalidQuery(format!(
                "query vector dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let state = self.state.acquire().await;
        if state.index.size() == 0 {
            return Ok(Vec::new());
        }
        if let Some(filter) = filter {
            if let Some(predicate) = filter.predicate() {
                debug!(%predicate, "vector search filter");
            }
        }

        let fetch = if filter.is_some() { k * FILTER_FETCH_FACTOR } else { k };
        let matches = state
            .index
            .search(query, fetch.max(1))
            .map_err(|e| Error::Internal(format!("vector search: {e}")))?;

        let mut hits = Vec::with_capacity(k);
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(chunk) = state.chunks.get(key) else { continue };
            if let Some(filter) = filter {
                if !filter.matches(&chunk.relative_path) {
                    continue;
                }
            }
            hits.push(VectorHit {
                id: chunk.id.clone(),
                path: chunk.relative_path.clone(),
                text: chunk.text.clone(),
                score: (1.0 - distance).clamp(0.0, 1.0),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    /// Indexed file paths matching a user glob, capped.
    pub async fn search_by_path(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let regex = compile_path_pattern(pattern)?;
        let files = self.indexed_files().await;
        if files.len() > config::MAX_GLOB_RESULTS {
            return Err(Error::ResourceLimit(format!(
                "{} indexed files exceed the {} pattern-scan cap",
                files.len(),
                config::MAX_GLOB_RESULTS
            )));
        }
        Ok(files.into_iter().filter(|f| regex.is_match(f)).take(limit).collect())
    }

    /// Unique indexed relative paths, sorted.
    pub async fn indexed_files(&self) -> Vec<String> {
        let state = self.state.acquire().await;
        let mut files: Vec<String> =
            state.chunks.values().map(|c| c.relative_path.clone()).collect();
        files.sort();
        files.dedup();
        files
    }

    pub async fn chunks_by_ids(&self, ids: &[String]) -> HashMap<String, Chunk> {
        let state = self.state.acquire().await;
        let wanted: std::collections::HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        state
            .chunks
            .values()
            .filter(|c| wanted.contains(c.id.as_str()))
            .map(|c| (c.id.clone(), c.clone()))
            .collect()
    }

    pub async fn storage_size_bytes(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        total += meta.len();
                    }
                }
            }
        }
        total
    }

    /// Forces the in-memory state to disk.
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.acquire().await;
        self.persist(&state)
    }

    /// Flush and release the lock file. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let state = self.state.acquire().await;
        self.persist(&state)?;
        let _ = std::fs::remove_file(self.dir.join(LOCK_FILE));
        Ok(())
    }

    fn persist(&self, state: &VectorState) -> Result<()> {
        // usearch writes in place, so stage through a temp file and
        // rename for the same either-old-or-new guarantee as the JSON
        // sidecars.
        let target = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!(
            "{INDEX_FILE}.tmp.{}.{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
            std::process::id()
        ));
        let result = state
            .index
            .save(tmp.to_string_lossy().as_ref())
            .map_err(|e| Error::Internal(format!("vector index save: {e}")))
            .and_then(|_| std::fs::rename(&tmp, &target).map_err(Error::from));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
            return result;
        }

        let sidecar = ChunkSidecar { next_key: state.next_key, chunks: state.chunks.clone() };
        atomic_write_json(&self.dir.join(CHUNKS_FILE), &sidecar, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::hash_text;

    fn chunk(path: &str, start: usize, end: usize, text: &str) -> Chunk {
        Chunk {
            id: format!("{path}:{start}-{end}"),
            relative_path: path.to_string(),
            start_line: start,
            end_line: end,
            text: text.to_string(),
            content_hash: hash_text(text),
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[tokio::test]
    async fn insert_search_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = VectorStore::open(dir.path().join("vectors"), 8).await.unwrap();

        store
            .insert_chunks(vec![
                (chunk("src/a.rs", 1, 3, "alpha"), unit(8, 0)),
                (chunk("src/b.rs", 1, 3, "beta"), unit(8, 1)),
            ])
            .await
            .unwrap();

        let hits = store.search(&unit(8, 0), 2, None).await.unwrap();
        assert_eq!(hits[0].path, "src/a.rs");
        assert!(hits[0].score > 0.99);
        assert!(hits[0].score <= 1.0);
    }

    #[tokio::test]
    async fn delete_by_path_removes_everything_for_the_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = VectorStore::open(dir.path().join("vectors"), 4).await.unwrap();

        store
            .insert_chunks(vec![
                (chunk("gone.rs", 1, 2, "one"), unit(4, 0)),
                (chunk("gone.rs", 3, 4, "two"), unit(4, 1)),
                (chunk("kept.rs", 1, 2, "three"), unit(4, 2)),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_by_path("gone.rs").await.unwrap(), 2);
        assert_eq!(store.indexed_files().await, vec!["kept.rs"]);
        let matches = store.search_by_path("gone*", 10).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vectors");
        {
            let store = VectorStore::open(path.clone(), 4).await.unwrap();
            store
                .insert_chunks(vec![(chunk("src/a.rs", 1, 1, "hello"), unit(4, 3))])
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        let store = VectorStore::open(path, 4).await.unwrap();
        assert_eq!(store.len().await, 1);
        let hits = store.search(&unit(4, 3), 1, None).await.unwrap();
        assert_eq!(hits[0].id, "src/a.rs:1-1");
    }

    #[tokio::test]
    async fn filter_restricts_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = VectorStore::open(dir.path().join("vectors"), 4).await.unwrap();
        store
            .insert_chunks(vec![
                (chunk("src/a.rs", 1, 1, "x"), unit(4, 0)),
                (chunk("tests/b.rs", 1, 1, "y"), unit(4, 0)),
            ])
            .await
            .unwrap();

        let filter = SearchFilter { path_prefix: Some("src/".to_string()) };
        let hits = store.search(&unit(4, 0), 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/a.rs");
    }

    #[tokio::test]
    async fn chunks_by_ids_returns_requested_subset() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = VectorStore::open(dir.path().join("vectors"), 4).await.unwrap();
        store
            .insert_chunks(vec![
                (chunk("a.rs", 1, 1, "x"), unit(4, 0)),
                (chunk("b.rs", 2, 5, "y"), unit(4, 1)),
            ])
            .await
            .unwrap();

        let map = store.chunks_by_ids(&["b.rs:2-5".to_string(), "nope:1-1".to_string()]).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map["b.rs:2-5"].text, "y");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = VectorStore::open(dir.path().join("vectors"), 4).await.unwrap();
        let err = store.search(&[1.0, 0.0], 1, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    #[test]
    fn escape_chokepoints() {
        assert_eq!(escape_filter_string("a'b\\c"), "a''b\\\\c");
        assert_eq!(escape_filter_string("nul\0"), "nul\\0");
        assert_eq!(escape_like_pattern("50%_done[x]"), "50\\%\\_done\\[x]");
    }

    #[tokio::test]
    async fn stale_lock_is_reaped_on_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let store_dir = dir.path().join("vectors");
        std::fs::create_dir_all(&store_dir).unwrap();
        let lock = store_dir.join(".lock");
        std::fs::write(&lock, "12345").unwrap();
        // Backdate far past the stale threshold.
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::OpenOptions::new().write(true).open(&lock).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let store = VectorStore::open(store_dir.clone(), 4).await.unwrap();
        // The store owns a fresh lock now.
        assert!(store_dir.join(".lock").exists());
        store.close().await.unwrap();
        assert!(!store_dir.join(".lock").exists());
    }
}
