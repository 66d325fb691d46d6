//! Reconciliation of a tracked directory against its remote.
//!
//! ## `reconcile` protocol
//!
//! 1. The directory must be the top level of a git working tree.
//! 2. When a [`GitRemote`] is given it is bound first ([`SyncEngine::bind_remote`]).
//! 3. `git pull --ff-only <remote> <branch>`.
//! 4. On failure: `git fetch --all --prune`, then
//!    - [`ConflictPolicy::FavorRemote`]: `git reset --hard <remote>/<branch>`
//!    - [`ConflictPolicy::FavorLocal`]: `git merge -X ours <remote>/<branch>`
//!      (aborted again if it fails, so no half-merged tree is left behind).
//! 5. A failure in step 4 is a [`SyncError::SyncConflict`] carrying git's own
//!    message. Nothing further is attempted.
//!
//! The policy only applies once the fast pull has failed. Uncommitted edits
//! to files the incoming commits leave alone do not block a fast-forward, so
//! they survive a successful step 3 under either policy. Edits that collide
//! with incoming changes make the pull fail, and `FavorRemote` then discards
//! every local change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use reposync_core::GitRemote;

use crate::error::SyncError;
use crate::git::{Git, GitOutput};

/// Who wins when the fast pull fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Hard-reset to the remote tip; local edits and unpushed commits are discarded.
    #[default]
    FavorRemote,
    /// Merge the remote tip, resolving conflicting hunks with the local side.
    FavorLocal,
}

impl ConflictPolicy {
    pub fn from_favor_remote(favor_remote: bool) -> Self {
        if favor_remote {
            Self::FavorRemote
        } else {
            Self::FavorLocal
        }
    }
}

/// How a successful reconciliation got there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Pulled { head: String },
    ResetToRemote { head: String },
    MergedKeepingLocal { head: String },
}

impl ReconcileOutcome {
    pub fn head(&self) -> &str {
        match self {
            Self::Pulled { head } | Self::ResetToRemote { head } | Self::MergedKeepingLocal { head } => {
                head
            }
        }
    }
}

/// What [`SyncEngine::bind_remote`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBinding {
    Added,
    Updated,
    Unchanged,
}

/// Static engine configuration, fixed for the daemon's lifetime.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub git_program: PathBuf,
    pub timeout: Duration,
    pub branch: String,
    pub remote_name: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            git_program: PathBuf::from("git"),
            timeout: Duration::from_secs(120),
            branch: "master".to_owned(),
            remote_name: "origin".to_owned(),
        }
    }
}

/// Identity used for merge commits the engine creates.
const MERGE_IDENTITY: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "reposync"),
    ("GIT_AUTHOR_EMAIL", "reposync@localhost"),
    ("GIT_COMMITTER_NAME", "reposync"),
    ("GIT_COMMITTER_EMAIL", "reposync@localhost"),
];

#[derive(Debug, Clone)]
pub struct SyncEngine {
    git: Git,
    branch: String,
    remote_name: String,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            git: Git::new(settings.git_program, settings.timeout),
            branch: settings.branch,
            remote_name: settings.remote_name,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// `git --version`; the daemon refuses to start without it.
    pub fn ensure_available(&self) -> Result<String, SyncError> {
        let cwd = std::env::temp_dir();
        let out = self.git.run(&cwd, &["--version"], None)?;
        if !out.success() {
            return Err(SyncError::GitUnavailable {
                program: self.git.program().to_path_buf(),
            });
        }
        Ok(out.stdout.trim().to_owned())
    }

    /// `true` when `dir` is the top level of a working tree (a directory
    /// nested inside some other repository does not count).
    pub fn is_work_tree(&self, dir: &Path) -> Result<bool, SyncError> {
        if !dir.is_dir() {
            return Ok(false);
        }
        let out = self.git.run(dir, &["rev-parse", "--show-toplevel"], None)?;
        if !out.success() {
            return Ok(false);
        }
        let toplevel = PathBuf::from(out.stdout.trim());
        let same = match (std::fs::canonicalize(&toplevel), std::fs::canonicalize(dir)) {
            (Ok(a), Ok(b)) => a == b,
            _ => toplevel == dir,
        };
        Ok(same)
    }

    /// Create a repository in `dir` on the configured branch. Only run on
    /// explicit request; tracked directories are never initialized implicitly.
    pub fn init_repository(&self, dir: &Path) -> Result<(), SyncError> {
        self.checked(dir, &["init"], None)?;
        let head = format!("refs/heads/{}", self.branch);
        self.checked(dir, &["symbolic-ref", "HEAD", head.as_str()], None)?;
        tracing::info!(
            "initialized git repository at {} on branch {}",
            dir.display(),
            self.branch
        );
        Ok(())
    }

    /// Point the configured remote name at `remote.url`.
    ///
    /// Adds the remote if absent, rewrites a stale URL, then reads the URL
    /// back; any mismatch is [`SyncError::RemoteBinding`].
    pub fn bind_remote(&self, dir: &Path, remote: &GitRemote) -> Result<RemoteBinding, SyncError> {
        let expected = remote.url.as_str();
        let current = self.remote_url(dir)?;
        let binding = match current.as_deref() {
            None => {
                self.checked(dir, &["remote", "add", self.remote_name.as_str(), expected], None)?;
                RemoteBinding::Added
            }
            Some(url) if url != expected => {
                self.checked(dir, &["remote", "set-url", self.remote_name.as_str(), expected], None)?;
                RemoteBinding::Updated
            }
            Some(_) => RemoteBinding::Unchanged,
        };

        let actual = self.remote_url(dir)?.unwrap_or_default();
        if actual != expected {
            return Err(SyncError::RemoteBinding {
                dir: dir.to_path_buf(),
                remote: self.remote_name.clone(),
                expected: expected.to_owned(),
                actual,
            });
        }
        if binding != RemoteBinding::Unchanged {
            tracing::info!(
                "remote '{}' in {} bound ({binding:?})",
                self.remote_name,
                dir.display()
            );
        }
        Ok(binding)
    }

    /// Bring `dir` in line with the remote branch. See the module docs;
    /// a fast-forward keeps uncommitted edits that do not collide.
    pub fn reconcile(
        &self,
        dir: &Path,
        remote: Option<&GitRemote>,
        policy: ConflictPolicy,
    ) -> Result<ReconcileOutcome, SyncError> {
        if !self.is_work_tree(dir)? {
            return Err(SyncError::NotARepository {
                dir: dir.to_path_buf(),
            });
        }
        if let Some(remote) = remote {
            self.bind_remote(dir, remote)?;
        }

        let pull = self.git.run(
            dir,
            &["pull", "--ff-only", self.remote_name.as_str(), self.branch.as_str()],
            remote,
        )?;
        if pull.success() {
            tracing::info!("pulled {} from {}", dir.display(), self.remote_name);
            return Ok(ReconcileOutcome::Pulled {
                head: self.head(dir)?,
            });
        }
        tracing::warn!(
            "fast pull failed in {}, falling back to {policy:?}: {}",
            dir.display(),
            pull.diagnostic()
        );

        self.fallback(dir, &["fetch", "--all", "--prune"], remote, &[])?;
        let tracking = format!("{}/{}", self.remote_name, self.branch);

        match policy {
            ConflictPolicy::FavorRemote => {
                self.fallback(dir, &["reset", "--hard", tracking.as_str()], None, &[])?;
                tracing::info!("reset {} to {tracking}", dir.display());
                Ok(ReconcileOutcome::ResetToRemote {
                    head: self.head(dir)?,
                })
            }
            ConflictPolicy::FavorLocal => {
                let merge = ["merge", "--no-edit", "-X", "ours", tracking.as_str()];
                let out = self.git.run_with_env(dir, &merge, None, &MERGE_IDENTITY)?;
                if !out.success() {
                    let _ = self.git.run(dir, &["merge", "--abort"], None);
                    return Err(self.conflict(dir, &merge, &out));
                }
                tracing::info!("merged {tracking} into {} keeping local side", dir.display());
                Ok(ReconcileOutcome::MergedKeepingLocal {
                    head: self.head(dir)?,
                })
            }
        }
    }

    /// Commit id of `HEAD` in `dir`.
    pub fn head(&self, dir: &Path) -> Result<String, SyncError> {
        let out = self.checked(dir, &["rev-parse", "HEAD"], None)?;
        Ok(out.stdout.trim().to_owned())
    }

    fn remote_url(&self, dir: &Path) -> Result<Option<String>, SyncError> {
        let out = self
            .git
            .run(dir, &["remote", "get-url", self.remote_name.as_str()], None)?;
        Ok(out.success().then(|| out.stdout.trim().to_owned()))
    }

    fn checked(
        &self,
        dir: &Path,
        args: &[&str],
        auth: Option<&GitRemote>,
    ) -> Result<GitOutput, SyncError> {
        let out = self.git.run(dir, args, auth)?;
        if out.success() {
            Ok(out)
        } else {
            Err(SyncError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                dir: dir.to_path_buf(),
                diagnostic: out.diagnostic(),
            })
        }
    }

    fn fallback(
        &self,
        dir: &Path,
        args: &[&str],
        auth: Option<&GitRemote>,
        env: &[(&str, &str)],
    ) -> Result<GitOutput, SyncError> {
        let out = self.git.run_with_env(dir, args, auth, env)?;
        if out.success() {
            Ok(out)
        } else {
            Err(self.conflict(dir, args, &out))
        }
    }

    fn conflict(&self, dir: &Path, args: &[&str], out: &GitOutput) -> SyncError {
        SyncError::SyncConflict {
            dir: dir.to_path_buf(),
            command: format!("git {}", args.join(" ")),
            diagnostic: out.diagnostic(),
        }
    }
}
