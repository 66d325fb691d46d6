//! Per-directory sync dispatch.
//!
//! A [`SyncDispatcher`] keeps at most one reconciliation in flight for its
//! directory. Requests that arrive while one is running collapse into a
//! single "run again" flag, so a burst of triggers costs at most two runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use reposync_core::{SharedRegistry, TrackedDirectory};
use reposync_sync::{ConflictPolicy, ReconcileOutcome, SyncEngine};

use crate::error::DaemonError;

/// The seam between dispatch and the sync engine. Runs on a blocking thread.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, dir: &TrackedDirectory) -> Result<ReconcileOutcome, DaemonError>;
}

/// Reconciles through git and stamps `last_save_time` on success.
pub struct GitReconciler {
    engine: SyncEngine,
    registry: Arc<SharedRegistry>,
    policy: ConflictPolicy,
}

impl GitReconciler {
    pub fn new(engine: SyncEngine, registry: Arc<SharedRegistry>, policy: ConflictPolicy) -> Self {
        Self {
            engine,
            registry,
            policy,
        }
    }
}

impl Reconciler for GitReconciler {
    fn reconcile(&self, dir: &TrackedDirectory) -> Result<ReconcileOutcome, DaemonError> {
        let remote = self.registry.remote();
        let outcome = self
            .engine
            .reconcile(&dir.path, remote.as_ref(), self.policy)?;
        self.registry.record_save(&dir.path, Utc::now())?;
        Ok(outcome)
    }
}

/// Result of [`SyncDispatcher::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// A new run was started.
    Started,
    /// A run is in flight; one more will follow it.
    Queued,
}

#[derive(Debug, Default)]
struct Gate {
    running: bool,
    rerun: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

pub struct SyncDispatcher {
    directory: TrackedDirectory,
    reconciler: Arc<dyn Reconciler>,
    gate: Mutex<Gate>,
    stats: Mutex<SyncStats>,
}

impl SyncDispatcher {
    pub fn new(directory: TrackedDirectory, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            directory,
            reconciler,
            gate: Mutex::new(Gate::default()),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Ask for a sync. Must be called from within a tokio runtime.
    pub fn request(self: &Arc<Self>, source: &'static str) -> Dispatch {
        {
            let mut gate = lock(&self.gate);
            if gate.running {
                gate.rerun = true;
                tracing::debug!(dir = %self.directory.name, source, "sync already running; queued");
                return Dispatch::Queued;
            }
            gate.running = true;
            lock(&self.stats).in_flight = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(source).await });
        Dispatch::Started
    }

    pub fn stats(&self) -> SyncStats {
        lock(&self.stats).clone()
    }

    async fn drive(self: Arc<Self>, source: &'static str) {
        loop {
            self.run_once(source).await;
            if !self.take_rerun() {
                break;
            }
        }
    }

    /// Consume the rerun flag, or release the gate when there is none.
    fn take_rerun(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.rerun {
            gate.rerun = false;
            return true;
        }
        gate.running = false;
        lock(&self.stats).in_flight = false;
        false
    }

    async fn run_once(&self, source: &'static str) {
        let started = Instant::now();
        let reconciler = Arc::clone(&self.reconciler);
        let directory = self.directory.clone();
        let result = tokio::task::spawn_blocking(move || reconciler.reconcile(&directory))
            .await
            .map_err(|err| DaemonError::Protocol(format!("sync task join error: {err}")))
            .and_then(|inner| inner);

        let mut stats = lock(&self.stats);
        stats.runs += 1;
        stats.last_run_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                tracing::info!(
                    dir = %self.directory.name,
                    source,
                    head = outcome.head(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "sync completed",
                );
                stats.succeeded += 1;
                stats.last_outcome = Some(outcome);
                stats.last_error = None;
            }
            Err(err) => {
                tracing::error!(dir = %self.directory.name, source, error = %err, "sync failed");
                stats.failed += 1;
                stats.last_error = Some(err.to_string());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reposync_sync::SyncError;

    /// Counts calls; each call blocks for `delay`.
    pub(crate) struct FakeReconciler {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub fail: bool,
    }

    impl FakeReconciler {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Reconciler for FakeReconciler {
        fn reconcile(&self, dir: &TrackedDirectory) -> Result<ReconcileOutcome, DaemonError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(SyncError::NotARepository {
                    dir: dir.path.clone(),
                }
                .into());
            }
            Ok(ReconcileOutcome::Pulled {
                head: "0000000".to_string(),
            })
        }
    }

    fn directory() -> TrackedDirectory {
        TrackedDirectory {
            name: "notes".into(),
            path: "/tmp/notes".into(),
            last_save_time: None,
        }
    }

    async fn settle(dispatcher: &SyncDispatcher) {
        for _ in 0..200 {
            if !dispatcher.stats().in_flight {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher never went idle");
    }

    #[tokio::test]
    async fn triggers_during_a_run_collapse_into_one_rerun() {
        let fake = Arc::new(FakeReconciler::new(Duration::from_millis(150)));
        let dispatcher = Arc::new(SyncDispatcher::new(directory(), fake.clone()));

        assert_eq!(dispatcher.request("test"), Dispatch::Started);
        for _ in 0..5 {
            assert_eq!(dispatcher.request("test"), Dispatch::Queued);
        }
        settle(&dispatcher).await;

        assert_eq!(fake.calls(), 2);
        let stats = dispatcher.stats();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.succeeded, 2);
        assert!(stats.last_outcome.is_some());
    }

    #[tokio::test]
    async fn failures_are_counted_and_reported() {
        let fake = Arc::new(FakeReconciler {
            fail: true,
            ..FakeReconciler::new(Duration::ZERO)
        });
        let dispatcher = Arc::new(SyncDispatcher::new(directory(), fake));

        dispatcher.request("test");
        settle(&dispatcher).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert!(stats
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("not a git working tree")));
    }
}
