//! # reposync-sync
//!
//! Git reconciliation engine.
//!
//! Call [`SyncEngine::reconcile`] to bring one tracked directory in line with
//! its remote, or [`SyncEngine::bind_remote`] to (re)point the remote URL.
//! Everything here is blocking; the daemon runs it on blocking worker threads.

pub mod engine;
pub mod error;
pub mod git;

pub use engine::{ConflictPolicy, ReconcileOutcome, RemoteBinding, SyncEngine, SyncSettings};
pub use error::SyncError;
pub use git::{Git, GitOutput};
