//! Keyword (BM25) indexing over chunk text. Two interchangeable engines:
//! a native tantivy index (preferred at scale) and a pure in-process
//! inverted index for environments where native index files are
//! unwanted. Selection follows configuration; `auto` picks native once
//! the expected chunk count clears a threshold.

mod native;
mod portable;

pub use native::NativeFts;
pub use portable::{PortableFts, Tokenizer, default_tokenizer};

use crate::chunker::Chunk;
use crate::config::FtsEngineKind;
use crate::error::Result;
use serde::Serialize;
use std::path::Path;

/// Above this expected chunk count, `auto` selects the native engine.
const AUTO_NATIVE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct FtsHit {
    pub id: String,
    pub path: String,
    pub text: String,
    pub score: f32,
    pub start_line: usize,
    pub end_line: usize,
}

pub trait FtsEngine: Send + Sync {
    /// Resolved engine kind (never `auto`).
    fn kind(&self) -> FtsEngineKind;

    fn add_chunks(&mut self, chunks: &[Chunk]) -> Result<()>;

    fn remove_by_path(&mut self, relative_path: &str) -> Result<()>;

    /// BM25-ranked hits; queries are tokenized exactly like indexed text.
    fn search(&self, query: &str, k: usize) -> Result<Vec<FtsHit>>;

    fn len(&self) -> usize;

    /// Persists pending state. Engines that write on every mutation may
    /// treat this as a no-op.
    fn commit(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Rescales scores so the best hit is exactly 1.0, preserving order.
pub fn normalize_scores(mut hits: Vec<FtsHit>) -> Vec<FtsHit> {
    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    if max > 0.0 {
        for hit in &mut hits {
            hit.score /= max;
        }
    }
    hits
}

/// Opens the engine for `kind`, resolving `auto` from the expected chunk
/// count.
pub fn open_engine(
    kind: FtsEngineKind,
    dir: &Path,
    expected_chunks: usize,
) -> Result<Box<dyn FtsEngine>> {
    let resolved = match kind {
        FtsEngineKind::Native => FtsEngineKind::Native,
        FtsEngineKind::Portable => FtsEngineKind::Portable,
        FtsEngineKind::Auto => {
            if expected_chunks > AUTO_NATIVE_THRESHOLD {
                FtsEngineKind::Native
            } else {
                FtsEngineKind::Portable
            }
        }
    };
    match resolved {
        FtsEngineKind::Native => Ok(Box::new(NativeFts::open(dir)?)),
        _ => Ok(Box::new(PortableFts::open(dir)?)),
    }
}

#[cfg(test)]
pub(crate) fn test_chunk(path: &str, start: usize, end: usize, text: &str) -> Chunk {
    Chunk {
        id: format!("{path}:{start}-{end}"),
        relative_path: path.to_string(),
        start_line: start,
        end_line: end,
        text: text.to_string(),
        content_hash: crate::chunker::hash_text(text),
    }
}
