//! Tantivy-backed keyword engine: one document per chunk, BM25 scoring.

use super::{FtsEngine, FtsHit};
use crate::chunker::Chunk;
use crate::config::FtsEngineKind;
use crate::error::{Error, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, INDEXED, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument};

/// Writer heap for batch mutations. Tantivy rejects budgets below its
/// minimum, so stay comfortably above it.
const WRITER_BUDGET_BYTES: usize = 50_000_000;

#[derive(Clone)]
struct ChunkSchema {
    id: Field,
    path: Field,
    text: Field,
    start_line: Field,
    end_line: Field,
    schema: Schema,
}

impl ChunkSchema {
    fn build() -> Self {
        let mut builder = Schema::builder();
        let id = builder.add_text_field("id", STRING | STORED);
        let path = builder.add_text_field("path", STRING | STORED);
        let text = builder.add_text_field("text", TEXT | STORED);
        let start_line = builder.add_u64_field("start_line", INDEXED | STORED);
        let end_line = builder.add_u64_field("end_line", INDEXED | STORED);
        let schema = builder.build();
        Self { id, path, text, start_line, end_line, schema }
    }
}

pub struct NativeFts {
    index: Index,
    reader: IndexReader,
    schema: ChunkSchema,
}

impl NativeFts {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = ChunkSchema::build();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)
                .map_err(|e| Error::IndexCorrupt(format!("keyword index open: {e}")))?
        } else {
            Index::create_in_dir(dir, schema.schema.clone())
                .map_err(|e| Error::Internal(format!("keyword index create: {e}")))?
        };
        let reader = index
            .reader()
            .map_err(|e| Error::Internal(format!("keyword index reader: {e}")))?;
        Ok(Self { index, reader, schema })
    }

    fn writer(&self) -> Result<IndexWriter> {
        self.index
            .writer(WRITER_BUDGET_BYTES)
            .map_err(|e| Error::Internal(format!("keyword index writer: {e}")))
    }

    fn commit_and_reload(&self, mut writer: IndexWriter) -> Result<()> {
        writer
            .commit()
            .map_err(|e| Error::Internal(format!("keyword index commit: {e}")))?;
        self.reader
            .reload()
            .map_err(|e| Error::Internal(format!("keyword index reload: {e}")))?;
        Ok(())
    }
}

impl FtsEngine for NativeFts {
    fn kind(&self) -> FtsEngineKind {
        FtsEngineKind::Native
    }

    fn add_chunks(&mut self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        for chunk in chunks {
            // Replace semantics: a re-added chunk id supersedes the old
            // document.
            writer.delete_term(tantivy::Term::from_field_text(self.schema.id, &chunk.id));
            let mut doc = TantivyDocument::new();
            doc.add_text(self.schema.id, &chunk.id);
            doc.add_text(self.schema.path, &chunk.relative_path);
            doc.add_text(self.schema.text, &chunk.text);
            doc.add_u64(self.schema.start_line, chunk.start_line as u64);
            doc.add_u64(self.schema.end_line, chunk.end_line as u64);
            writer
                .add_document(doc)
                .map_err(|e| Error::Internal(format!("keyword index add: {e}")))?;
        }
        self.commit_and_reload(writer)
    }

    fn remove_by_path(&mut self, relative_path: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.delete_term(tantivy::Term::from_field_text(self.schema.path, relative_path));
        self.commit_and_reload(writer)
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<FtsHit>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.schema.text]);
        // Lenient parse: user queries are natural language, not tantivy
        // syntax, and stray punctuation must not fail the search.
        let (parsed, _errors) = parser.parse_query_lenient(query);

        let top = searcher
            .search(&parsed, &TopDocs::with_limit(k.max(1)))
            .map_err(|e| Error::Internal(format!("keyword search: {e}")))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| Error::Internal(format!("keyword doc fetch: {e}")))?;
            let text_of = |field: Field| {
                doc.get_first(field).and_then(|v| v.as_str()).unwrap_or_default().to_string()
            };
            let u64_of = |field: Field| {
                doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0) as usize
            };
            hits.push(FtsHit {
                id: text_of(self.schema.id),
                path: text_of(self.schema.path),
                text: text_of(self.schema.text),
                score,
                start_line: u64_of(self.schema.start_line),
                end_line: u64_of(self.schema.end_line),
            });
        }
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    fn commit(&mut self) -> Result<()> {
        // Mutations commit eagerly; nothing is buffered here.
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fts::test_chunk;

    #[test]
    fn ranks_matching_chunks_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = NativeFts::open(dir.path()).unwrap();
        engine
            .add_chunks(&[
                test_chunk("src/auth.rs", 1, 5, "token verification and session auth"),
                test_chunk("src/math.rs", 1, 5, "matrix multiplication kernels"),
            ])
            .unwrap();

        let hits = engine.search("session auth token", 5).unwrap();
        assert_eq!(hits[0].path, "src/auth.rs");
        assert_eq!(hits[0].start_line, 1);
        assert_eq!(hits[0].end_line, 5);
    }

    #[test]
    fn readding_a_chunk_id_replaces_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = NativeFts::open(dir.path()).unwrap();
        engine.add_chunks(&[test_chunk("a.rs", 1, 2, "first version")]).unwrap();
        engine.add_chunks(&[test_chunk("a.rs", 1, 2, "second version")]).unwrap();
        assert_eq!(engine.len(), 1);
        let hits = engine.search("second", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut engine = NativeFts::open(dir.path()).unwrap();
            engine.add_chunks(&[test_chunk("a.rs", 1, 2, "persisted content")]).unwrap();
        }
        let engine = NativeFts::open(dir.path()).unwrap();
        assert_eq!(engine.len(), 1);
        assert!(!engine.search("persisted", 5).unwrap().is_empty());
    }

    #[test]
    fn punctuation_heavy_queries_do_not_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = NativeFts::open(dir.path()).unwrap();
        engine.add_chunks(&[test_chunk("a.rs", 1, 2, "fn call()")]).unwrap();
        assert!(engine.search("fn call() && [weird] ~syntax", 5).is_ok());
    }
}
