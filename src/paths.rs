//! Path canonicalization, project containment, and the policy deciding
//! which files enter the index.

use crate::config::{self, Config};
use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

#[cfg(windows)]
const MAX_PATH_LEN: usize = 260;
#[cfg(not(windows))]
const MAX_PATH_LEN: usize = 4096;

/// Directories that are never indexed, regardless of configuration.
/// Catches build artifacts and dependency caches even when .gitignore
/// is absent.
const DENY_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    ".next",
    ".nuxt",
    ".output",
    ".vite",
    ".turbo",
    ".svelte-kit",
    ".parcel-cache",
    "__pycache__",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "coverage",
    ".nyc_output",
    ".cache",
    "vendor",
    ".gradle",
    ".terraform",
    ".eggs",
    ".idea",
    ".vscode",
    ".cargo",
];

/// Canonical absolute form of a user-supplied project root. Must exist
/// and be a directory.
pub fn canonicalize_project(path: &Path) -> Result<PathBuf> {
    let canonical = dunce::canonicalize(path)
        .map_err(|_| Error::ProjectNotDetected(path.to_string_lossy().to_string()))?;
    if !canonical.is_dir() {
        return Err(Error::ProjectNotDetected(canonical.to_string_lossy().to_string()));
    }
    Ok(canonical)
}

/// Resolves `relative` against `root`, refusing anything whose canonical
/// form escapes the root: parent components, absolute inputs, embedded
/// NUL bytes, and symlinks pointing outside.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.as_bytes().contains(&0) {
        return Err(Error::PathTraversal(relative.replace('\0', "\\0")));
    }
    let rel = Path::new(relative);
    if rel.is_absolute() || relative.starts_with('/') || relative.starts_with('\\') {
        return Err(Error::PathTraversal(relative.to_string()));
    }

    // Lexical resolution first, so `a/b/../c` stays legal while `../x`
    // fails before touching the filesystem.
    let mut depth: isize = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::PathTraversal(relative.to_string()));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(relative.to_string()));
            }
        }
    }

    let joined = root.join(rel);
    if joined.as_os_str().len() > MAX_PATH_LEN {
        return Err(Error::ResourceLimit(format!(
            "path longer than {MAX_PATH_LEN} characters"
        )));
    }

    // Canonicalize the deepest existing ancestor to catch symlinks that
    // point outside the project.
    let mut probe = joined.clone();
    let mut suffix = PathBuf::new();
    loop {
        match dunce::canonicalize(&probe) {
            Ok(canonical) => {
                let resolved = canonical.join(&suffix);
                if !resolved.starts_with(root) {
                    if probe.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false)
                    {
                        return Err(Error::SymlinkNotAllowed(relative.to_string()));
                    }
                    return Err(Error::PathTraversal(relative.to_string()));
                }
                return Ok(resolved);
            }
            Err(_) => {
                let Some(parent) = probe.parent() else {
                    return Err(Error::FileNotFound(relative.to_string()));
                };
                let Some(name) = probe.file_name() else {
                    return Err(Error::FileNotFound(relative.to_string()));
                };
                suffix = Path::new(name).join(&suffix);
                probe = parent.to_path_buf();
            }
        }
    }
}

/// Forward-slash relative path of `abs` under `root`.
pub fn to_relative(root: &Path, abs: &Path) -> String {
    abs.strip_prefix(root)
        .unwrap_or(abs)
        .to_string_lossy()
        .replace('\\', "/")
}

fn in_denied_dir(relative_path: &str) -> Option<&'static str> {
    for component in Path::new(relative_path).components() {
        if let Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if let Some(denied) = DENY_DIRS.iter().find(|d| **d == name) {
                return Some(denied);
            }
            if name.ends_with(".egg-info") {
                return Some("egg-info");
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Path pattern sanitization
// ---------------------------------------------------------------------------

/// Compiles a user glob into a regex, tokenizing literal text separately
/// from wildcards so metacharacters in the literal parts cannot reach any
/// downstream query language. Supported wildcards: `*`, `?`, and `**/`.
pub fn compile_path_pattern(pattern: &str) -> Result<regex::Regex> {
    if pattern.is_empty() {
        return Err(Error::InvalidPattern("empty pattern".to_string()));
    }
    if pattern.len() > config::MAX_PATTERN_LENGTH {
        return Err(Error::InvalidPattern(format!(
            "pattern longer than {} characters",
            config::MAX_PATTERN_LENGTH
        )));
    }
    let wildcards = pattern.chars().filter(|c| *c == '*' || *c == '?').count();
    if wildcards > config::MAX_PATTERN_WILDCARDS {
        return Err(Error::InvalidPattern(format!(
            "more than {} wildcards",
            config::MAX_PATTERN_WILDCARDS
        )));
    }

    let mut regex = String::from("(?i)^");
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**` crosses directory separators.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str("[^/]");
            }
            _ => literal.push(c),
        }
    }
    regex.push_str(&regex::escape(&literal));
    regex.push('$');

    regex::Regex::new(&regex).map_err(|e| Error::InvalidPattern(e.to_string()))
}

// ---------------------------------------------------------------------------
// Indexing policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub indexable: bool,
    pub reason: &'static str,
}

impl Decision {
    fn yes(reason: &'static str) -> Self {
        Self { indexable: true, reason }
    }
    fn no(reason: &'static str) -> Self {
        Self { indexable: false, reason }
    }
}

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub relative_path: String,
    pub size: u64,
    pub is_doc: bool,
}

pub struct PathPolicy {
    root: PathBuf,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    doc_patterns: GlobSet,
    respect_gitignore: bool,
    index_docs: bool,
    max_file_size: u64,
    max_files: usize,
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).map_err(|e| Error::InvalidPattern(format!("{pattern}: {e}")))?;
        builder.add(glob);
    }
    Ok(Some(builder.build().map_err(|e| Error::InvalidPattern(e.to_string()))?))
}

impl PathPolicy {
    pub fn new(root: PathBuf, config: &Config) -> Result<Self> {
        Ok(Self {
            root,
            include: build_globset(&config.include)?,
            exclude: build_globset(&config.exclude)?,
            doc_patterns: build_globset(&config.doc_patterns)?.unwrap_or_else(GlobSet::empty),
            respect_gitignore: config.respect_gitignore,
            index_docs: config.index_docs,
            max_file_size: config.max_file_size,
            max_files: config.max_files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_doc(&self, relative_path: &str) -> bool {
        self.doc_patterns.is_match(relative_path)
    }

    /// Policy decision for a single path. Size of 0 is accepted for paths
    /// whose metadata is not yet known (the scanner re-checks).
    pub fn should_index(&self, relative_path: &str, size: u64) -> Decision {
        if in_denied_dir(relative_path).is_some() {
            return Decision::no("denied directory");
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(relative_path) {
                return Decision::no("exclude pattern");
            }
        }
        if let Some(include) = &self.include {
            if !include.is_match(relative_path) {
                return Decision::no("not in include patterns");
            }
        }
        if size > self.max_file_size {
            return Decision::no("file too large");
        }
        if self.is_doc(relative_path) {
            return if self.index_docs {
                Decision::yes("documentation")
            } else {
                Decision::no("documentation indexing disabled")
            };
        }
        let ext = crate::lang::extension_of(relative_path);
        if !config::is_supported_extension(&ext) {
            return Decision::no("unsupported extension");
        }
        Decision::yes("source file")
    }

    /// Walks the project and returns every indexable file, sorted by
    /// relative path. Exceeding `max_files` fails the scan rather than
    /// silently truncating it.
    pub fn scan(&self) -> Result<Vec<ScanEntry>> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .follow_links(false)
            .max_depth(Some(config::MAX_WALK_DEPTH))
            .build();

        let mut entries = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("scan error: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let relative = to_relative(&self.root, entry.path());
            let decision = self.should_index(&relative, metadata.len());
            if !decision.indexable {
                continue;
            }
            entries.push(ScanEntry {
                is_doc: self.is_doc(&relative),
                relative_path: relative,
                size: metadata.len(),
            });
            if entries.len() > self.max_files {
                return Err(Error::FileLimitWarning {
                    count: entries.len(),
                    max: self.max_files,
                });
            }
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }
}
