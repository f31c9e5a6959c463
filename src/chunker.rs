//! Splits file text into bounded, position-tagged fragments.
//!
//! Two strategies: `character` slides fixed-size windows aligned to line
//! starts, `code_aware` cuts at recognized declaration boundaries and
//! falls back to character windows for unknown languages.

use crate::config::{self, ChunkingStrategyKind};
use crate::error::{Error, Result};
use crate::lang;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Maximum number of characters per chunk. Tuned for code: ~1024 chars
/// keeps fragments inside the embedding token budget while staying
/// granular enough for retrieval.
const MAX_CHUNK_CHARS: usize = 1024;

/// Overlap between adjacent character-mode chunks, for continuity.
const CHUNK_OVERLAP_CHARS: usize = 96;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id: `<relative_path>:<start_line>-<end_line>`.
    pub id: String,
    pub relative_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// SHA-256 of `text`, hex.
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerSettings {
    pub max_chars: usize,
    pub overlap: usize,
    pub max_chunks: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            max_chars: MAX_CHUNK_CHARS,
            overlap: CHUNK_OVERLAP_CHARS,
            max_chunks: config::MAX_CHUNKS_PER_FILE,
        }
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chunks one file. Exceeding the per-file chunk cap fails this file with
/// a resource-limit error; callers record it and continue the batch.
pub fn chunk_file(
    relative_path: &str,
    content: &str,
    strategy: ChunkingStrategyKind,
    settings: &ChunkerSettings,
) -> Result<Vec<Chunk>> {
    let spans = match strategy {
        ChunkingStrategyKind::Character => character_spans(content, settings),
        ChunkingStrategyKind::CodeAware => {
            let language = lang::detect_language(&lang::extension_of(relative_path));
            match boundary_lines(content, language) {
                Some(boundaries) => code_aware_spans(content, &boundaries, settings),
                None => character_spans(content, settings),
            }
        }
    };

    if spans.len() > settings.max_chunks {
        return Err(Error::ResourceLimit(format!(
            "{relative_path} produced {} chunks, cap is {}",
            spans.len(),
            settings.max_chunks
        )));
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        if let Some(chunk) = finalize(relative_path, &lines, start, end) {
            chunks.push(chunk);
        }
    }
    Ok(chunks)
}

/// Builds a chunk from a 1-based inclusive line span, trimming blank
/// leading/trailing lines (adjusting the span) and edge whitespace.
fn finalize(relative_path: &str, lines: &[&str], start: usize, end: usize) -> Option<Chunk> {
    let mut start = start;
    let mut end = end.min(lines.len());
    while start <= end && lines[start - 1].trim().is_empty() {
        start += 1;
    }
    while end >= start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    if start > end {
        return None;
    }
    let text = lines[start - 1..end].join("\n").trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(Chunk {
        id: format!("{relative_path}:{start}-{end}"),
        relative_path: relative_path.to_string(),
        start_line: start,
        end_line: end,
        content_hash: hash_text(&text),
        text,
    })
}

/// Line-aligned sliding windows of roughly `max_chars`, overlapping by
/// `overlap` characters. Returns 1-based inclusive spans.
fn character_spans(content: &str, settings: &ChunkerSettings) -> Vec<(usize, usize)> {
    if content.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    let mut spans = Vec::new();
    let mut window_start = 0usize;
    let mut window_chars = 0usize;

    for (i, line) in lines.iter().enumerate() {
        let line_chars = line.len() + 1;
        if window_chars + line_chars > settings.max_chars && i > window_start {
            spans.push((window_start + 1, i));

            // Back up by `overlap` characters, but always advance at least
            // one line so a large overlap cannot stall the window.
            let mut kept_chars = 0usize;
            let mut new_start = i;
            for j in (window_start..i).rev() {
                kept_chars += lines[j].len() + 1;
                if kept_chars >= settings.overlap {
                    new_start = j;
                    break;
                }
            }
            window_start = new_start.max(window_start + 1);
            window_chars = lines[window_start..i].iter().map(|l| l.len() + 1).sum();
        }
        window_chars += line_chars;
    }
    if window_start < lines.len() {
        spans.push((window_start + 1, lines.len()));
    }
    spans
}

/// Spans cut at declaration boundaries, with oversized segments falling
/// back to character windows and undersized neighbors coalesced.
fn code_aware_spans(
    content: &str,
    boundaries: &[usize],
    settings: &ChunkerSettings,
) -> Vec<(usize, usize)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    // Segment [start, end) line ranges between consecutive boundaries.
    let mut cut_points: Vec<usize> = boundaries.iter().copied().filter(|b| *b > 0).collect();
    cut_points.dedup();
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut prev = 0usize;
    for cut in cut_points {
        if cut > prev {
            segments.push((prev, cut));
            prev = cut;
        }
    }
    if prev < lines.len() {
        segments.push((prev, lines.len()));
    }

    let segment_chars =
        |seg: &(usize, usize)| lines[seg.0..seg.1].iter().map(|l| l.len() + 1).sum::<usize>();

    // Coalesce small adjacent segments up to the size budget.
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for segment in segments {
        match merged.last_mut() {
            Some(last) if segment_chars(last) + segment_chars(&segment) <= settings.max_chars => {
                last.1 = segment.1;
            }
            _ => merged.push(segment),
        }
    }

    let mut spans = Vec::new();
    for (start, end) in merged {
        if segment_chars(&(start, end)) <= settings.max_chars {
            spans.push((start + 1, end));
        } else {
            let segment_text = lines[start..end].join("\n");
            for (s, e) in character_spans(&segment_text, settings) {
                spans.push((start + s, start + e));
            }
        }
    }
    spans
}

/// 0-based indices of lines that start a recognized declaration, or None
/// when the language has no boundary rules.
fn boundary_lines(content: &str, language: &str) -> Option<Vec<usize>> {
    static RUST: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:pub(?:\([\w: ]+\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|impl|mod|macro_rules!)\b").unwrap()
    });
    static TS_JS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function|class|interface|enum|namespace)\b|^(?:export\s+)?(?:const|let|type)\s+\w+\s*[:=]").unwrap()
    });
    static PYTHON: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(?:async\s+)?def\s+\w+|^class\s+\w+|^@\w+").unwrap());
    static GO: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^func\b|^type\s+\w+\s+(?:struct|interface)\b").unwrap());
    static C_LIKE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:public|private|protected|static|class|struct|namespace|template|void|int)\b").unwrap()
    });

    let regex: &Regex = match language {
        "rust" => &RUST,
        "typescript" | "javascript" => &TS_JS,
        "python" => &PYTHON,
        "go" => &GO,
        "java" | "kotlin" | "scala" | "c" | "cpp" | "csharp" => &C_LIKE,
        _ => return None,
    };

    Some(
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| regex.is_match(line))
            .map(|(i, _)| i)
            .collect(),
    )
}
