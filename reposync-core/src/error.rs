//! Error types for reposync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Reasons a [`TrackedDirectory`](crate::types::TrackedDirectory) cannot be
/// constructed.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("directory does not exist: {path}")]
    PathMissing { path: PathBuf },

    #[error("path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory name must not be empty")]
    EmptyName,

    /// No name was given and the path has no final segment (e.g. `/`).
    #[error("cannot derive a directory name from {path}; pass one explicitly")]
    NoDerivableName { path: PathBuf },

    #[error("invalid remote URL '{url}': {reason}")]
    InvalidRemoteUrl { url: String, reason: String },

    #[error("invalid version '{0}'; expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),
}

/// All errors that can arise from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (save path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parse error on load, with the file path and serde_json's line/column.
    #[error("failed to parse registry at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.reposync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The registry file did not exist at the expected path.
    #[error("registry not found at {path}")]
    RegistryNotFound { path: PathBuf },

    #[error("directory path already tracked: {path}")]
    DuplicatePath { path: PathBuf },

    #[error("directory name already tracked: {name}")]
    DuplicateName { name: String },

    #[error("no tracked directory matches {selector}")]
    NotFound { selector: String },

    #[error("delete requires a name or a path")]
    NoSelector,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}
