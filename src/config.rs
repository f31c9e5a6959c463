use crate::error::{Error, Result};
use crate::sync::atomic_write_json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Resource caps, enforced at the edges with specific errors
// ---------------------------------------------------------------------------

/// Maximum allowed length for search queries (characters).
pub const MAX_QUERY_LENGTH: usize = 1000;
/// Maximum length of a path glob pattern.
pub const MAX_PATTERN_LENGTH: usize = 200;
/// Maximum number of wildcard tokens in a path glob pattern.
pub const MAX_PATTERN_WILDCARDS: usize = 10;
/// Soft cap on chunks produced from a single file.
pub const MAX_CHUNKS_PER_FILE: usize = 1000;
/// Directory walk depth cap.
pub const MAX_WALK_DEPTH: usize = 20;
/// Parse cap for persisted JSON config.
pub const MAX_CONFIG_BYTES: u64 = 10 * 1024 * 1024;
/// Cap on files returned by a path-pattern scan.
pub const MAX_GLOB_RESULTS: usize = 100_000;

/// Embedding batch sizes handed to the embedder.
pub const CPU_EMBED_BATCH: usize = 32;
pub const GPU_EMBED_BATCH: usize = 64;

/// Canonical list of file extensions considered source code. The chunker,
/// the policy layer, and the scanners all use this single list so they
/// never diverge.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // JavaScript / TypeScript
    "ts", "tsx", "js", "jsx", "mjs", "cjs",
    // Systems / compiled
    "rs", "py", "go", "java", "c", "cpp", "h", "hpp",
    "cs", "rb", "php", "swift", "kt", "scala",
    // Web
    "html", "css", "scss", "less", "sass",
    // Data / config
    "json", "yaml", "yml", "toml", "xml",
    // Documentation
    "md", "mdx", "txt", "rst",
    // Query / schema
    "sql", "graphql", "gql",
    // Shell
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd",
    // Frontend frameworks
    "vue", "svelte", "astro",
    // Misc languages
    "lua", "zig", "nim", "dart", "ex", "exs",
    "r", "jl", "clj", "cljs", "cljc", "erl", "hrl",
    // Infra / IPC
    "tf", "hcl", "proto",
    // Dotfiles / config
    "env", "ini", "cfg", "conf",
];

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

// ---------------------------------------------------------------------------
// Recognized configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStrategyKind {
    Realtime,
    Lazy,
    Git,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategyKind {
    Character,
    CodeAware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FtsEngineKind {
    Auto,
    /// Pure in-process engine, no native index files.
    #[serde(alias = "js")]
    Portable,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSearchConfig {
    pub enabled: bool,
    pub fts_engine: FtsEngineKind,
    pub default_alpha: f32,
    /// RRF rank constant. Rarely worth changing.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
}

fn default_rrf_k() -> f32 {
    60.0
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fts_engine: FtsEngineKind::Auto,
            default_alpha: 0.7,
            rrf_k: default_rrf_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub respect_gitignore: bool,
    /// Per-file size cap in bytes.
    pub max_file_size: u64,
    /// Total indexable file cap.
    pub max_files: usize,
    pub doc_patterns: Vec<String>,
    pub index_docs: bool,
    pub indexing_strategy: IndexingStrategyKind,
    pub chunking_strategy: ChunkingStrategyKind,
    pub hybrid_search: HybridSearchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            respect_gitignore: true,
            max_file_size: 10 * 1024 * 1024,
            max_files: 100_000,
            doc_patterns: vec![
                "**/*.md".to_string(),
                "**/*.mdx".to_string(),
                "**/*.rst".to_string(),
                "**/*.txt".to_string(),
            ],
            index_docs: true,
            indexing_strategy: IndexingStrategyKind::Lazy,
            chunking_strategy: ChunkingStrategyKind::CodeAware,
            hybrid_search: HybridSearchConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|_| Error::FileNotFound(path.to_string_lossy().to_string()))?;
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(Error::ResourceLimit(format!(
                "config file is {} bytes, cap is {}",
                meta.len(),
                MAX_CONFIG_BYTES
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::IndexCorrupt(format!("config.json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, false)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.hybrid_search.default_alpha) {
            return Err(Error::InvalidQuery(format!(
                "default_alpha must be within [0, 1], got {}",
                self.hybrid_search.default_alpha
            )));
        }
        if self.max_file_size == 0 || self.max_files == 0 {
            return Err(Error::ResourceLimit(
                "max_file_size and max_files must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

/// User-scoped storage root; `LODESTONE_DATA_DIR` overrides the platform
/// data directory.
pub fn storage_root() -> PathBuf {
    std::env::var("LODESTONE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("lodestone"))
                .unwrap_or_else(|| PathBuf::from(".lodestone-data"))
        })
}

/// Private index directory for a project, keyed by a hash of its canonical
/// path so sibling projects never collide.
pub fn index_dir_for(storage_root: &Path, project_root: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(project_root.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    storage_root.join("indexes").join(&digest[..16])
}

/// File names inside an index directory.
pub mod layout {
    pub const METADATA: &str = "metadata.json";
    pub const CONFIG: &str = "config.json";
    pub const FINGERPRINTS: &str = "fingerprints.json";
    pub const DOCS_FINGERPRINTS: &str = "docs_fingerprints.json";
    pub const MERKLE: &str = "merkle.json";
    pub const VECTORS_DIR: &str = "vectors";
    pub const DOCS_VECTORS_DIR: &str = "docs_vectors";
    pub const FTS_DIR: &str = "fts";
    pub const DIRTY_FILES: &str = "dirty_files.json";
    pub const LOGS_DIR: &str = "logs";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.indexing_strategy, IndexingStrategyKind::Lazy);
        assert_eq!(back.hybrid_search.rrf_k, 60.0);
    }

    #[test]
    fn js_is_an_alias_for_portable() {
        let json = r#"{"hybrid_search": {"enabled": true, "fts_engine": "js", "default_alpha": 0.5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.hybrid_search.fts_engine, FtsEngineKind::Portable);
    }

    #[test]
    fn alpha_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.hybrid_search.default_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn index_dirs_differ_per_project() {
        let root = Path::new("/tmp/store");
        let a = index_dir_for(root, Path::new("/home/u/project-a"));
        let b = index_dir_for(root, Path::new("/home/u/project-b"));
        assert_ne!(a, b);
        assert!(a.starts_with(root.join("indexes")));
    }

    #[test]
    fn load_missing_config_is_file_not_found() {
        let err = Config::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert_eq!(err.code(), "FILE_NOT_FOUND");
    }
}
