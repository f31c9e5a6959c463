use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no index found for project: {0}")]
    IndexNotFound(String),

    #[error("no documentation index found for project: {0}")]
    DocsIndexNotFound(String),

    #[error("an index already exists for project: {0}")]
    IndexExists(String),

    #[error("index data is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("an indexing run is already in progress")]
    IndexingInProgress,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file is excluded from indexing: {path} ({reason})")]
    FileExcluded { path: String, reason: String },

    #[error("path escapes the project root: {0}")]
    PathTraversal(String),

    #[error("symlinks pointing outside the project are not allowed: {0}")]
    SymlinkNotAllowed(String),

    #[error("embedding model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("embedding model download failed: {0}")]
    ModelDownloadFailed(String),

    #[error("not enough free disk space: need ~{needed} bytes, {available} available")]
    DiskFull { needed: u64, available: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("project exceeds the configured file limit: {count} files (max {max})")]
    FileLimitWarning { count: usize, max: usize },

    #[error("not a project: {0}")]
    ProjectNotDetected(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code, independent of message wording.
    pub fn code(&self) -> &'static str {
        match self {
            Error::IndexNotFound(_) => "INDEX_NOT_FOUND",
            Error::DocsIndexNotFound(_) => "DOCS_INDEX_NOT_FOUND",
            Error::IndexExists(_) => "INDEX_EXISTS",
            Error::IndexCorrupt(_) => "INDEX_CORRUPT",
            Error::IndexingInProgress => "INDEXING_IN_PROGRESS",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::InvalidPattern(_) => "INVALID_PATTERN",
            Error::FileNotFound(_) => "FILE_NOT_FOUND",
            Error::FileExcluded { .. } => "FILE_EXCLUDED",
            Error::PathTraversal(_) => "PATH_TRAVERSAL",
            Error::SymlinkNotAllowed(_) => "SYMLINK_NOT_ALLOWED",
            Error::ModelLoadFailed(_) => "MODEL_LOAD_FAILED",
            Error::ModelDownloadFailed(_) => "MODEL_DOWNLOAD_FAILED",
            Error::DiskFull { .. } => "DISK_FULL",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::FileLimitWarning { .. } => "FILE_LIMIT_WARNING",
            Error::ProjectNotDetected(_) => "PROJECT_NOT_DETECTED",
            Error::ResourceLimit(_) => "RESOURCE_LIMIT",
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => "FILE_NOT_FOUND",
            Error::Io(_) | Error::Serde(_) | Error::Internal(_) => "INTERNAL",
        }
    }

    /// Friendly message, safe to show verbatim. No raw paths, no wrapped
    /// error chains.
    pub fn user_message(&self) -> String {
        match self {
            Error::IndexNotFound(_) => {
                "This project has not been indexed yet. Run create_index first.".to_string()
            }
            Error::DocsIndexNotFound(_) => {
                "Documentation indexing is not enabled for this project.".to_string()
            }
            Error::IndexExists(_) => {
                "An index already exists for this project. Use reindex_project to rebuild it."
                    .to_string()
            }
            Error::IndexCorrupt(_) => {
                "The index data is corrupt. Delete and recreate the index.".to_string()
            }
            Error::IndexingInProgress => {
                "Indexing is already running for this project. Try again once it completes."
                    .to_string()
            }
            Error::InvalidQuery(msg) => format!("Invalid search query: {msg}"),
            Error::InvalidPattern(msg) => format!("Invalid path pattern: {msg}"),
            Error::FileNotFound(path) => format!("File not found: {path}"),
            Error::FileExcluded { path, reason } => {
                format!("{path} is excluded from indexing ({reason})")
            }
            Error::PathTraversal(_) => "The requested path is outside the project.".to_string(),
            Error::SymlinkNotAllowed(_) => {
                "Symlinks pointing outside the project are not followed.".to_string()
            }
            Error::ModelLoadFailed(_) => "The embedding model could not be loaded.".to_string(),
            Error::ModelDownloadFailed(_) => {
                "The embedding model could not be downloaded. Check your network connection."
                    .to_string()
            }
            Error::DiskFull { .. } => "Not enough free disk space to build the index.".to_string(),
            Error::PermissionDenied(_) => "Permission denied.".to_string(),
            Error::FileLimitWarning { count, max } => format!(
                "The project contains {count} indexable files, above the limit of {max}. \
                 Narrow the include patterns or raise max_files."
            ),
            Error::ProjectNotDetected(_) => {
                "No project was detected at this location.".to_string()
            }
            Error::ResourceLimit(msg) => format!("Resource limit exceeded: {msg}"),
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                "Permission denied.".to_string()
            }
            Error::Io(_) | Error::Serde(_) | Error::Internal(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }

    /// Technical detail for debugging; only surfaced in debug mode.
    pub fn developer_message(&self) -> String {
        self.to_string()
    }

    /// JSON error envelope. The developer message is included only when
    /// `debug` is set (the `DEBUG` environment variable at the edges).
    pub fn to_json(&self, debug: bool) -> serde_json::Value {
        let mut body = json!({
            "code": self.code(),
            "user_message": self.user_message(),
        });
        if debug {
            body["developer_message"] = json!(self.developer_message());
        }
        body
    }
}

/// Whether error payloads should carry developer messages.
pub fn debug_mode() -> bool {
    std::env::var("DEBUG").map(|v| !v.is_empty() && v != "0").unwrap_or(false)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::IndexNotFound(_)
            | Error::DocsIndexNotFound(_)
            | Error::FileNotFound(_)
            | Error::ProjectNotDetected(_) => StatusCode::NOT_FOUND,
            Error::IndexExists(_) | Error::IndexingInProgress => StatusCode::CONFLICT,
            Error::InvalidQuery(_) | Error::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            Error::FileExcluded { .. }
            | Error::PathTraversal(_)
            | Error::SymlinkNotAllowed(_)
            | Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::FileLimitWarning { .. } | Error::ResourceLimit(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::DiskFull { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::FORBIDDEN
            }
            Error::IndexCorrupt(_)
            | Error::ModelLoadFailed(_)
            | Error::ModelDownloadFailed(_)
            | Error::Io(_)
            | Error::Serde(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self.to_json(debug_mode()))).into_response()
    }
}
