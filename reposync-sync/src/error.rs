//! Error types for reposync-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All errors that can arise from git orchestration.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The git executable could not be launched at all.
    #[error("git executable '{program}' not found; install git or set git_program")]
    GitUnavailable { program: PathBuf },

    /// Spawning or waiting on the child failed for another reason.
    #[error("failed to run `{command}` in {dir}: {source}")]
    Spawn {
        command: String,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child outlived its deadline and was killed.
    #[error("`{command}` in {dir} timed out after {after:?}")]
    Timeout {
        command: String,
        dir: PathBuf,
        after: Duration,
    },

    #[error("{dir} is not a git working tree")]
    NotARepository { dir: PathBuf },

    /// A git step outside the reconciliation fallback failed.
    #[error("`{command}` failed in {dir}: {diagnostic}")]
    CommandFailed {
        command: String,
        dir: PathBuf,
        diagnostic: String,
    },

    /// Both the direct pull and the fallback strategy failed.
    #[error("could not reconcile {dir} (`{command}`): {diagnostic}")]
    SyncConflict {
        dir: PathBuf,
        command: String,
        diagnostic: String,
    },

    /// The remote URL read back after a write differs from what was written.
    #[error("remote '{remote}' in {dir} points to '{actual}', expected '{expected}'")]
    RemoteBinding {
        dir: PathBuf,
        remote: String,
        expected: String,
        actual: String,
    },
}
