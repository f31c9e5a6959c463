//! Hybrid retrieval: vector KNN and keyword BM25 executed in parallel,
//! fused by Reciprocal Rank Fusion, then post-processed (same-file
//! dedup/merge, whitespace trim, truncation).

use crate::config;
use crate::embedder::{EmbedPurpose, Embedder};
use crate::error::{Error, Result};
use crate::fts::{self, FtsEngine};
use crate::sync::AsyncMutex;
use crate::vector::VectorStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Result set bounds.
const MIN_TOP_K: usize = 1;
const MAX_TOP_K: usize = 50;

/// How many candidates each source contributes before fusion.
const FUSION_FETCH_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Fts,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Fts => "fts",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

/// Anything outside the known set falls back to hybrid.
pub fn validate_search_mode(input: Option<&str>) -> SearchMode {
    match input.unwrap_or_default() {
        "vector" => SearchMode::Vector,
        "fts" => SearchMode::Fts,
        _ => SearchMode::Hybrid,
    }
}

/// Absent alpha takes the configured default; present values clamp into
/// [0, 1].
pub fn validate_alpha(input: Option<f64>, default: f32) -> f32 {
    match input {
        Some(alpha) if alpha.is_finite() => (alpha as f32).clamp(0.0, 1.0),
        _ => default,
    }
}

pub fn clamp_top_k(top_k: usize) -> usize {
    top_k.clamp(MIN_TOP_K, MAX_TOP_K)
}

/// Reciprocal Rank Fusion. Ranks are 1-based per source; 0 means absent
/// from that source. `alpha` weighs the vector side, `1 - alpha` the
/// keyword side.
pub fn rrf_score(rank_vector: usize, rank_fts: usize, alpha: f32, k_const: f32) -> f32 {
    let vector_part = if rank_vector > 0 { 1.0 / (k_const + rank_vector as f32) } else { 0.0 };
    let fts_part = if rank_fts > 0 { 1.0 / (k_const + rank_fts as f32) } else { 0.0 };
    alpha * vector_part + (1.0 - alpha) * fts_part
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub path: String,
    pub text: String,
    pub score: f32,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// Mode actually executed, after any fallback.
    pub effective_mode: SearchMode,
}

pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub alpha: f32,
    pub top_k: usize,
    pub rrf_k: f32,
    pub purpose: EmbedPurpose,
}

/// Runs one search against a vector store and an optional keyword engine.
pub async fn execute(
    vectors: &VectorStore,
    fts: Option<&AsyncMutex<Box<dyn FtsEngine>>>,
    embedder: Arc<dyn Embedder>,
    request: &SearchRequest,
) -> Result<SearchOutcome> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(Error::InvalidQuery("query must not be empty".to_string()));
    }
    if query.len() > config::MAX_QUERY_LENGTH {
        return Err(Error::InvalidQuery(format!(
            "query is {} characters, cap is {}",
            query.len(),
            config::MAX_QUERY_LENGTH
        )));
    }
    let top_k = clamp_top_k(request.top_k);
    let fetch = top_k * FUSION_FETCH_FACTOR;

    // Keyword-only requests never pay for an embedding.
    let mut effective_mode = request.mode;
    if effective_mode != SearchMode::Fts {
        let fts_usable = fts.is_some();
        if effective_mode == SearchMode::Hybrid && !fts_usable {
            effective_mode = SearchMode::Vector;
        }
    }

    let hits = match effective_mode {
        SearchMode::Vector => {
            let vector_hits = knn(vectors, embedder, query, request.purpose, fetch).await?;
            vector_hits
                .into_iter()
                .map(|h| SearchHit {
                    id: h.id,
                    path: h.path,
                    text: h.text,
                    score: h.score,
                    start_line: h.start_line,
                    end_line: h.end_line,
                })
                .collect()
        }
        SearchMode::Fts => match fts {
            Some(engine) => keyword(engine, query, fetch).await?,
            None => Vec::new(),
        },
        SearchMode::Hybrid => {
            let engine = fts.expect("hybrid implies keyword engine present");
            let (vector_hits, fts_hits) = tokio::join!(
                knn(vectors, embedder, query, request.purpose, fetch),
                keyword(engine, query, fetch),
            );
            let vector_hits = vector_hits?;
            let fts_hits = fts_hits?;
            if fts_hits.is_empty() && vector_hits.is_empty() {
                Vec::new()
            } else {
                fuse(vector_hits, fts_hits, request.alpha, request.rrf_k)
            }
        }
    };

    let mut hits = dedup_and_merge(hits);
    hits.truncate(top_k);
    Ok(SearchOutcome { hits, effective_mode })
}

async fn knn(
    vectors: &VectorStore,
    embedder: Arc<dyn Embedder>,
    query: &str,
    purpose: EmbedPurpose,
    fetch: usize,
) -> Result<Vec<crate::vector::VectorHit>> {
    let query = query.to_string();
    // Embedding is CPU-bound model inference; keep it off the reactor.
    let embeddings = tokio::task::spawn_blocking(move || {
        embedder.embed_batch(std::slice::from_ref(&query), purpose)
    })
    .await
    .map_err(|e| Error::Internal(format!("embed task failed: {e}")))??;

    let embedding = embeddings
        .into_iter()
        .next()
        .filter(|e| e.ok)
        .ok_or_else(|| Error::ModelLoadFailed("query embedding failed".to_string()))?;

    vectors.search(&embedding.vector, fetch, None).await
}

async fn keyword(
    engine: &AsyncMutex<Box<dyn FtsEngine>>,
    query: &str,
    fetch: usize,
) -> Result<Vec<SearchHit>> {
    let guard = engine.acquire().await;
    let hits = fts::normalize_scores(guard.search(query, fetch)?);
    Ok(hits
        .into_iter()
        .map(|h| SearchHit {
            id: h.id,
            path: h.path,
            text: h.text,
            score: h.score,
            start_line: h.start_line,
            end_line: h.end_line,
        })
        .collect())
}

/// RRF over the two ranked lists, then min-max normalization to [0, 1].
/// A chunk present in both sources is strictly boosted over either alone.
fn fuse(
    vector_hits: Vec<crate::vector::VectorHit>,
    fts_hits: Vec<SearchHit>,
    alpha: f32,
    k_const: f32,
) -> Vec<SearchHit> {
    let vector_ranks: HashMap<String, usize> = vector_hits
        .iter()
        .enumerate()
        .map(|(i, h)| (h.id.clone(), i + 1))
        .collect();
    let fts_ranks: HashMap<String, usize> =
        fts_hits.iter().enumerate().map(|(i, h)| (h.id.clone(), i + 1)).collect();

    let mut fused: HashMap<String, SearchHit> = HashMap::new();
    for hit in vector_hits {
        fused.insert(
            hit.id.clone(),
            SearchHit {
                id: hit.id,
                path: hit.path,
                text: hit.text,
                score: 0.0,
                start_line: hit.start_line,
                end_line: hit.end_line,
            },
        );
    }
    for hit in fts_hits {
        fused.entry(hit.id.clone()).or_insert(hit);
    }

    let mut hits: Vec<SearchHit> = fused
        .into_values()
        .map(|mut hit| {
            let rank_v = vector_ranks.get(hit.id.as_str()).copied().unwrap_or(0);
            let rank_f = fts_ranks.get(hit.id.as_str()).copied().unwrap_or(0);
            hit.score = rrf_score(rank_v, rank_f, alpha, k_const);
            hit
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id))
    });

    min_max_normalize(&mut hits);
    hits
}

fn min_max_normalize(hits: &mut [SearchHit]) {
    let Some(max) = hits.iter().map(|h| h.score).reduce(f32::max) else { return };
    let min = hits.iter().map(|h| h.score).fold(max, f32::min);
    let range = max - min;
    for hit in hits.iter_mut() {
        hit.score = if range > f32::EPSILON {
            (hit.score - min) / range
        } else {
            1.0
        };
    }
}

/// Same-file post-processing: chunks of one file whose line ranges touch
/// or overlap merge into a single result carrying the higher score and
/// the concatenated text. Applies to every non-empty result set.
pub fn dedup_and_merge(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    if hits.is_empty() {
        return hits;
    }

    let mut by_path: HashMap<String, Vec<SearchHit>> = HashMap::new();
    for hit in hits {
        by_path.entry(hit.path.clone()).or_default().push(hit);
    }

    let mut merged_all = Vec::new();
    for (_, mut group) in by_path {
        group.sort_by_key(|h| (h.start_line, h.end_line));
        let mut merged: Vec<SearchHit> = Vec::with_capacity(group.len());
        for hit in group {
            match merged.last_mut() {
                Some(last) if hit.start_line <= last.end_line + 1 => {
                    if hit.end_line > last.end_line {
                        last.text = format!("{}\n\n{}", last.text, hit.text);
                        last.end_line = hit.end_line;
                    }
                    last.score = last.score.max(hit.score);
                    last.id = format!("{}:{}-{}", last.path, last.start_line, last.end_line);
                }
                _ => merged.push(hit),
            }
        }
        merged_all.extend(merged);
    }

    for hit in &mut merged_all {
        let trimmed = hit.text.trim();
        if trimmed.len() != hit.text.len() {
            hit.text = trimmed.to_string();
        }
    }

    merged_all.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id))
    });
    merged_all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, start: usize, end: usize, score: f32, text: &str) -> SearchHit {
        SearchHit {
            id: format!("{path}:{start}-{end}"),
            path: path.to_string(),
            text: text.to_string(),
            score,
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn rrf_matches_reference_values() {
        let score = rrf_score(1, 2, 0.5, 60.0);
        let expected = 0.5 / 61.0 + 0.5 / 62.0;
        assert!((score - expected).abs() < 1e-6);
        assert!((expected - 0.0121).abs() < 1e-3);

        // Symmetric at alpha 0.5.
        assert_eq!(rrf_score(0, 1, 0.5, 60.0), rrf_score(1, 0, 0.5, 60.0));
    }

    #[test]
    fn rrf_is_decreasing_in_rank_and_zero_when_absent() {
        let mut last = f32::MAX;
        for rank in 1..20 {
            let score = rrf_score(rank, 0, 0.7, 60.0);
            assert!(score < last);
            last = score;
        }
        assert_eq!(rrf_score(0, 0, 0.7, 60.0), 0.0);
    }

    #[test]
    fn rrf_boosts_co_occurrence() {
        assert!(rrf_score(3, 3, 0.5, 60.0) > rrf_score(3, 0, 0.5, 60.0));
    }

    #[test]
    fn alpha_extremes_silence_one_source() {
        assert_eq!(rrf_score(0, 1, 1.0, 60.0), 0.0);
        assert_eq!(rrf_score(1, 0, 0.0, 60.0), 0.0);
    }

    #[test]
    fn mode_validation_defaults_to_hybrid() {
        assert_eq!(validate_search_mode(None), SearchMode::Hybrid);
        assert_eq!(validate_search_mode(Some("")), SearchMode::Hybrid);
        assert_eq!(validate_search_mode(Some("nonsense")), SearchMode::Hybrid);
        assert_eq!(validate_search_mode(Some("vector")), SearchMode::Vector);
        assert_eq!(validate_search_mode(Some("fts")), SearchMode::Fts);
    }

    #[test]
    fn alpha_validation_clamps_and_defaults() {
        assert_eq!(validate_alpha(Some(1.5), 0.7), 1.0);
        assert_eq!(validate_alpha(Some(-0.3), 0.7), 0.0);
        assert_eq!(validate_alpha(None, 0.3), 0.3);
        assert_eq!(validate_alpha(Some(f64::NAN), 0.4), 0.4);
    }

    #[test]
    fn top_k_clamps_to_bounds() {
        assert_eq!(clamp_top_k(0), 1);
        assert_eq!(clamp_top_k(10), 10);
        assert_eq!(clamp_top_k(500), 50);
    }

    #[test]
    fn overlapping_chunks_merge_keeping_higher_score() {
        let hits = vec![
            hit("src/a.ts", 10, 20, 0.9, "first block"),
            hit("src/a.ts", 18, 30, 0.8, "second block"),
        ];
        let merged = dedup_and_merge(hits);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start_line, 10);
        assert_eq!(merged[0].end_line, 30);
        assert_eq!(merged[0].score, 0.9);
        assert_eq!(merged[0].text, "first block\n\nsecond block");
        assert_eq!(merged[0].id, "src/a.ts:10-30");
    }

    #[test]
    fn adjacent_chain_collapses_to_one() {
        let hits: Vec<SearchHit> = (0..5)
            .map(|i| hit("src/a.rs", i * 10 + 1, (i + 1) * 10, 0.5, "block"))
            .collect();
        let merged = dedup_and_merge(hits);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start_line, 1);
        assert_eq!(merged[0].end_line, 50);
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let hits = vec![
            hit("src/a.rs", 1, 5, 0.9, "top"),
            hit("src/a.rs", 40, 50, 0.7, "bottom"),
            hit("src/b.rs", 1, 5, 0.8, "other file"),
        ];
        let merged = dedup_and_merge(hits);
        assert_eq!(merged.len(), 3);
        // No two results for one file touch or overlap afterwards.
        for a in &merged {
            for b in &merged {
                if a.id != b.id && a.path == b.path {
                    assert!(a.end_line + 1 < b.start_line || b.end_line + 1 < a.start_line);
                }
            }
        }
    }

    #[test]
    fn merged_text_is_trimmed() {
        let hits = vec![hit("a.rs", 1, 2, 0.5, "  padded  ")];
        let merged = dedup_and_merge(hits);
        assert_eq!(merged[0].text, "padded");
    }

    #[test]
    fn fusion_normalizes_into_unit_range() {
        let vector_hits = vec![
            crate::vector::VectorHit {
                id: "a.rs:1-2".into(), path: "a.rs".into(), text: "x".into(),
                score: 0.9, start_line: 1, end_line: 2,
            },
            crate::vector::VectorHit {
                id: "b.rs:1-2".into(), path: "b.rs".into(), text: "y".into(),
                score: 0.5, start_line: 1, end_line: 2,
            },
        ];
        let fts_hits = vec![hit("a.rs", 1, 2, 1.0, "x")];
        let fused = fuse(vector_hits, fts_hits, 0.5, 60.0);

        assert_eq!(fused[0].id, "a.rs:1-2");
        assert_eq!(fused[0].score, 1.0);
        assert!(fused.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        // Co-occurring result outranks the vector-only one.
        assert!(fused[0].score > fused[1].score);
    }
}
