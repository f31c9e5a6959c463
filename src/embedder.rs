//! Text → unit-vector embedding.
//!
//! The engine consumes the `Embedder` trait and never touches model
//! internals. `FastembedEmbedder` runs local ONNX models (downloaded on
//! first use): all-MiniLM-L6-v2 (384d) for code and bge-base-en-v1.5
//! (768d) for documentation. `HashEmbedder` is a deterministic offline
//! stand-in for tests and smoke runs.

use crate::config;
use crate::error::{Error, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

pub const CODE_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DOCS_MODEL_ID: &str = "BAAI/bge-base-en-v1.5";

pub const CODE_DIMENSION: usize = 384;
pub const DOCS_DIMENSION: usize = 768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Code,
    Docs,
}

impl EmbedPurpose {
    pub fn dimension(self) -> usize {
        match self {
            EmbedPurpose::Code => CODE_DIMENSION,
            EmbedPurpose::Docs => DOCS_DIMENSION,
        }
    }

    pub fn model_id(self) -> &'static str {
        match self {
            EmbedPurpose::Code => CODE_MODEL_ID,
            EmbedPurpose::Docs => DOCS_MODEL_ID,
        }
    }
}

/// One embedding result. `ok == false` means the text could not be
/// embedded; callers skip such chunks rather than storing zero vectors.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// `cpu`, `gpu-dml`, or `gpu-other`.
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl DeviceInfo {
    pub fn cpu() -> Self {
        Self { device: "cpu".to_string(), gpu_name: None, fallback_reason: None }
    }

    /// Embedding batch size for this device.
    pub fn batch_size(&self) -> usize {
        if self.device.starts_with("gpu") {
            config::GPU_EMBED_BATCH
        } else {
            config::CPU_EMBED_BATCH
        }
    }
}

pub trait Embedder: Send + Sync {
    /// Embeds a batch of texts. The result has exactly one entry per
    /// input, in order; failed entries come back with `ok == false`.
    /// Output vectors are L2-normalized.
    fn embed_batch(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Embedding>>;

    fn device_info(&self) -> DeviceInfo;
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// Fastembed-backed implementation
// ---------------------------------------------------------------------------

/// Models load lazily on first use and are guarded by a mutex: inference
/// sessions are not reentrant and embedding is CPU-bound anyway.
pub struct FastembedEmbedder {
    code: Mutex<Option<TextEmbedding>>,
    docs: Mutex<Option<TextEmbedding>>,
    device: DeviceInfo,
}

impl FastembedEmbedder {
    pub fn new() -> Self {
        Self {
            code: Mutex::new(None),
            docs: Mutex::new(None),
            device: DeviceInfo::cpu(),
        }
    }

    fn model_for(purpose: EmbedPurpose) -> EmbeddingModel {
        match purpose {
            EmbedPurpose::Code => EmbeddingModel::AllMiniLML6V2,
            EmbedPurpose::Docs => EmbeddingModel::BGEBaseENV15,
        }
    }

    fn classify_init_error(message: String) -> Error {
        let lower = message.to_lowercase();
        if lower.contains("download") || lower.contains("http") || lower.contains("request") {
            Error::ModelDownloadFailed(message)
        } else {
            Error::ModelLoadFailed(message)
        }
    }

    fn ensure_loaded(
        slot: &Mutex<Option<TextEmbedding>>,
        purpose: EmbedPurpose,
    ) -> Result<()> {
        let mut guard = slot.lock();
        if guard.is_some() {
            return Ok(());
        }
        info!(model = purpose.model_id(), dimension = purpose.dimension(), "loading embedding model");
        let model = TextEmbedding::try_new(
            InitOptions::new(Self::model_for(purpose)).with_show_download_progress(false),
        )
        .map_err(|e| Self::classify_init_error(e.to_string()))?;
        *guard = Some(model);
        Ok(())
    }

    fn slot(&self, purpose: EmbedPurpose) -> &Mutex<Option<TextEmbedding>> {
        match purpose {
            EmbedPurpose::Code => &self.code,
            EmbedPurpose::Docs => &self.docs,
        }
    }
}

impl Default for FastembedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for FastembedEmbedder {
    fn embed_batch(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self.slot(purpose);
        Self::ensure_loaded(slot, purpose)?;

        let batch = self.device.batch_size();
        let mut out = Vec::with_capacity(texts.len());
        let mut guard = slot.lock();
        let model = guard
            .as_mut()
            .ok_or_else(|| Error::ModelLoadFailed("model slot empty after init".to_string()))?;

        // Sub-batch so one bad batch marks only its own entries failed
        // instead of losing the whole file set.
        for window in texts.chunks(batch) {
            let docs: Vec<&str> = window.iter().map(|t| t.as_str()).collect();
            match model.embed(docs, Some(batch)) {
                Ok(vectors) => {
                    for mut vector in vectors {
                        l2_normalize(&mut vector);
                        out.push(Embedding { vector, ok: true });
                    }
                }
                Err(e) => {
                    tracing::warn!("embedding batch of {} failed: {e}", window.len());
                    out.extend(window.iter().map(|_| Embedding {
                        vector: vec![0.0; purpose.dimension()],
                        ok: false,
                    }));
                }
            }
        }
        Ok(out)
    }

    fn device_info(&self) -> DeviceInfo {
        self.device.clone()
    }
}

// ---------------------------------------------------------------------------
// Deterministic offline embedder
// ---------------------------------------------------------------------------

/// Projects token hashes into the target dimension. Identical text maps
/// to an identical unit vector, so exact-text queries score 1.0 and
/// everything else stays near zero. No model download, no network.
pub struct HashEmbedder;

impl HashEmbedder {
    fn embed_one(text: &str, dimension: usize) -> Vec<f32> {
        let mut vector = vec![0.0f32; dimension];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % dimension;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Embedder for HashEmbedder {
    fn embed_batch(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Embedding>> {
        Ok(texts
            .iter()
            .map(|t| Embedding { vector: Self::embed_one(t, purpose.dimension()), ok: true })
            .collect())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device: "cpu".to_string(),
            gpu_name: None,
            fallback_reason: Some("offline hash embedder".to_string()),
        }
    }
}
