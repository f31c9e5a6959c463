//! Pure in-process keyword engine: an inverted index with BM25 scoring,
//! serialized as one JSON file. Postings rebuild from stored documents
//! on load, so the on-disk format stays trivial.

use super::{FtsEngine, FtsHit};
use crate::chunker::Chunk;
use crate::config::FtsEngineKind;
use crate::error::{Error, Result};
use crate::sync::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// BM25 parameters tuned for code: repetition of an identifier inside a
/// chunk means less than in prose, and chunk lengths are already bounded.
const BM25_K1: f32 = 0.8;
const BM25_B: f32 = 0.5;

const STATE_FILE: &str = "portable.json";

/// Tokenization hook. The default lowercases and splits on anything that
/// is not alphanumeric or underscore; swap it to change behavior across
/// unicode scripts without touching scoring.
pub type Tokenizer = fn(&str) -> Vec<String>;

pub fn default_tokenizer(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    id: String,
    path: String,
    text: String,
    start_line: usize,
    end_line: usize,
    token_count: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    docs: Vec<DocEntry>,
}

pub struct PortableFts {
    state_path: PathBuf,
    docs: HashMap<String, DocEntry>,
    /// term -> doc id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    total_tokens: u64,
    tokenizer: Tokenizer,
    dirty: bool,
}

impl PortableFts {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let state_path = dir.join(STATE_FILE);
        let mut engine = Self {
            state_path,
            docs: HashMap::new(),
            postings: HashMap::new(),
            total_tokens: 0,
            tokenizer: default_tokenizer,
            dirty: false,
        };
        if engine.state_path.exists() {
            let json = std::fs::read_to_string(&engine.state_path)?;
            let persisted: PersistedState = serde_json::from_str(&json)
                .map_err(|e| Error::IndexCorrupt(format!("portable keyword state: {e}")))?;
            for doc in persisted.docs {
                engine.insert_doc(doc);
            }
            engine.dirty = false;
        }
        Ok(engine)
    }

    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    fn insert_doc(&mut self, mut doc: DocEntry) {
        let tokens = (self.tokenizer)(&doc.text);
        doc.token_count = tokens.len() as u32;
        self.total_tokens += doc.token_count as u64;
        for token in tokens {
            *self.postings.entry(token).or_default().entry(doc.id.clone()).or_insert(0) += 1;
        }
        self.docs.insert(doc.id.clone(), doc);
    }

    fn remove_doc(&mut self, id: &str) {
        let Some(doc) = self.docs.remove(id) else { return };
        self.total_tokens = self.total_tokens.saturating_sub(doc.token_count as u64);
        let tokens = (self.tokenizer)(&doc.text);
        for token in tokens {
            if let Some(tfs) = self.postings.get_mut(&token) {
                tfs.remove(id);
                if tfs.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    fn average_doc_len(&self) -> f32 {
        if self.docs.is_empty() {
            return 0.0;
        }
        self.total_tokens as f32 / self.docs.len() as f32
    }
}

impl FtsEngine for PortableFts {
    fn kind(&self) -> FtsEngineKind {
        FtsEngineKind::Portable
    }

    fn add_chunks(&mut self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            if self.docs.contains_key(&chunk.id) {
                self.remove_doc(&chunk.id.clone());
            }
            self.insert_doc(DocEntry {
                id: chunk.id.clone(),
                path: chunk.relative_path.clone(),
                text: chunk.text.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                token_count: 0,
            });
        }
        self.dirty = true;
        Ok(())
    }

    fn remove_by_path(&mut self, relative_path: &str) -> Result<()> {
        let ids: Vec<String> = self
            .docs
            .values()
            .filter(|d| d.path == relative_path)
            .map(|d| d.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            self.remove_doc(&id);
        }
        self.dirty = true;
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<FtsHit>> {
        let terms = (self.tokenizer)(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Ok(Vec::new());
        }

        let n = self.docs.len() as f32;
        let avg_len = self.average_doc_len().max(1.0);
        let mut scores: HashMap<&str, f32> = HashMap::new();

        for term in &terms {
            let Some(tfs) = self.postings.get(term) else { continue };
            let df = tfs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (doc_id, tf) in tfs {
                let doc = &self.docs[doc_id];
                let tf = *tf as f32;
                let len_norm = 1.0 - BM25_B + BM25_B * doc.token_count as f32 / avg_len;
                let score = idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * len_norm);
                *scores.entry(doc_id.as_str()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(&str, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0))
        });
        ranked.truncate(k);

        Ok(ranked
            .into_iter()
            .map(|(id, score)| {
                let doc = &self.docs[id];
                FtsHit {
                    id: doc.id.clone(),
                    path: doc.path.clone(),
                    text: doc.text.clone(),
                    score,
                    start_line: doc.start_line,
                    end_line: doc.end_line,
                }
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.docs.len()
    }

    fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut docs: Vec<DocEntry> = self.docs.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        atomic_write_json(&self.state_path, &PersistedState { docs }, false)?;
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.commit()
    }
}
