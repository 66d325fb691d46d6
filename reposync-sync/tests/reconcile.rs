//! Reconciliation against a real (local, bare) remote.
//!
//! These tests shell out to `git` and skip themselves when it is missing.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use reposync_core::GitRemote;
use reposync_sync::{ConflictPolicy, ReconcileOutcome, RemoteBinding, SyncEngine, SyncError, SyncSettings};
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

fn engine() -> SyncEngine {
    SyncEngine::new(SyncSettings {
        timeout: Duration::from_secs(30),
        ..SyncSettings::default()
    })
}

/// A bare "remote", a seed clone that pushes to it, and a local clone
/// standing in for the tracked directory.
struct Topology {
    _root: TempDir,
    seed: PathBuf,
    local: PathBuf,
}

impl Topology {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = TempDir::new().expect("root");
        let remote = root.path().join("remote.git");
        std::fs::create_dir(&remote).unwrap();
        git(&remote, &["init", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/master"]);

        let seed = root.path().join("seed");
        git(root.path(), &["clone", remote.to_str().unwrap(), "seed"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        std::fs::write(seed.join("notes.txt"), "one\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "first"]);
        git(&seed, &["push", "origin", "master"]);

        let local = root.path().join("local");
        git(root.path(), &["clone", remote.to_str().unwrap(), "local"]);

        Self {
            _root: root,
            seed,
            local,
        }
    }

    fn push_remote_change(&self, content: &str) -> String {
        std::fs::write(self.seed.join("notes.txt"), content).unwrap();
        git(&self.seed, &["commit", "-am", "remote edit"]);
        git(&self.seed, &["push", "origin", "master"]);
        git(&self.seed, &["rev-parse", "HEAD"])
    }
}

#[test]
fn clean_tree_fast_forwards() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    let remote_head = topo.push_remote_change("two\n");

    let outcome = engine()
        .reconcile(&topo.local, None, ConflictPolicy::FavorRemote)
        .expect("reconcile");

    assert!(matches!(outcome, ReconcileOutcome::Pulled { .. }), "got {outcome:?}");
    assert_eq!(outcome.head(), remote_head);
}

#[test]
fn favor_remote_discards_local_edits() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    let remote_head = topo.push_remote_change("two\n");
    std::fs::write(topo.local.join("notes.txt"), "local edit\n").unwrap();

    let outcome = engine()
        .reconcile(&topo.local, None, ConflictPolicy::FavorRemote)
        .expect("reconcile");

    assert!(matches!(outcome, ReconcileOutcome::ResetToRemote { .. }), "got {outcome:?}");
    assert_eq!(git(&topo.local, &["rev-parse", "HEAD"]), remote_head);
    assert_eq!(std::fs::read_to_string(topo.local.join("notes.txt")).unwrap(), "two\n");
    assert_eq!(git(&topo.local, &["status", "--porcelain"]), "");
}

#[test]
fn fast_forward_keeps_unrelated_uncommitted_edits() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    let remote_head = topo.push_remote_change("two\n");
    std::fs::write(topo.local.join("scratch.txt"), "draft\n").unwrap();

    let outcome = engine()
        .reconcile(&topo.local, None, ConflictPolicy::FavorRemote)
        .expect("reconcile");

    assert!(matches!(outcome, ReconcileOutcome::Pulled { .. }), "got {outcome:?}");
    assert_eq!(outcome.head(), remote_head);
    assert_eq!(std::fs::read_to_string(topo.local.join("notes.txt")).unwrap(), "two\n");
    assert_eq!(
        std::fs::read_to_string(topo.local.join("scratch.txt")).unwrap(),
        "draft\n"
    );
}

#[test]
fn favor_local_merges_keeping_local_side() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    let remote_head = topo.push_remote_change("two\n");
    std::fs::write(topo.local.join("notes.txt"), "mine\n").unwrap();
    git(&topo.local, &["commit", "-am", "local edit"]);

    let outcome = engine()
        .reconcile(&topo.local, None, ConflictPolicy::FavorLocal)
        .expect("reconcile");

    assert!(
        matches!(outcome, ReconcileOutcome::MergedKeepingLocal { .. }),
        "got {outcome:?}"
    );
    assert_eq!(std::fs::read_to_string(topo.local.join("notes.txt")).unwrap(), "mine\n");
    let merged_in = Command::new("git")
        .args(["merge-base", "--is-ancestor", &remote_head, "HEAD"])
        .current_dir(&topo.local)
        .status()
        .unwrap();
    assert!(merged_in.success(), "remote tip must be an ancestor after merge");
}

#[test]
fn plain_directory_is_not_a_repository() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let err = engine()
        .reconcile(dir.path(), None, ConflictPolicy::FavorRemote)
        .unwrap_err();
    assert!(matches!(err, SyncError::NotARepository { .. }), "got: {err}");
}

#[test]
fn subdirectory_of_a_repository_is_not_a_work_tree() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    let nested = topo.local.join("nested");
    std::fs::create_dir(&nested).unwrap();
    assert!(engine().is_work_tree(&topo.local).unwrap());
    assert!(!engine().is_work_tree(&nested).unwrap());
}

#[test]
fn unreachable_remote_surfaces_conflict_with_git_message() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let topo = Topology::new();
    git(
        &topo.local,
        &["remote", "set-url", "origin", "/nonexistent/remote.git"],
    );

    let err = engine()
        .reconcile(&topo.local, None, ConflictPolicy::FavorRemote)
        .unwrap_err();
    match err {
        SyncError::SyncConflict { diagnostic, .. } => assert!(!diagnostic.is_empty()),
        other => panic!("expected SyncConflict, got {other}"),
    }
}

#[test]
fn bind_remote_adds_updates_and_verifies() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let engine = engine();
    engine.init_repository(dir.path()).expect("init");
    assert!(engine.is_work_tree(dir.path()).unwrap());

    let first = GitRemote::new("https://git.example.com/team/notes.git", "t").unwrap();
    assert_eq!(engine.bind_remote(dir.path(), &first).unwrap(), RemoteBinding::Added);
    assert_eq!(engine.bind_remote(dir.path(), &first).unwrap(), RemoteBinding::Unchanged);

    let moved = GitRemote::new("https://git.example.com/team/moved.git", "t").unwrap();
    assert_eq!(engine.bind_remote(dir.path(), &moved).unwrap(), RemoteBinding::Updated);
    assert_eq!(
        git(dir.path(), &["remote", "get-url", "origin"]),
        "https://git.example.com/team/moved.git"
    );

    let config = std::fs::read_to_string(dir.path().join(".git").join("config")).unwrap();
    assert!(!config.contains("credential"), "token helper must not be persisted");
}
