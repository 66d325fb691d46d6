//! The watch controller: one per daemon, constructed in the composition root.
//!
//! Lifecycle:
//!
//! ```text
//! NotInitialized --new--> Initialized --start_all--> Starting --> Started
//! Initialized | Started --stop_all--> Stopping --> Stopped
//! ```
//!
//! Each watched directory owns a [`WatchHandle`]: a recursive notify watcher
//! whose callback feeds an unbounded channel, and a worker task that turns
//! those events into debounced sync requests.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use reposync_core::{GitRemote, RegistryError, SharedRegistry, TrackedDirectory};

use crate::debounce::{ChangeKind, DebounceSettings, DebounceSnapshot, Debouncer, Decision};
use crate::dispatcher::{Dispatch, Reconciler, SyncDispatcher, SyncStats};
use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    #[default]
    NotInitialized,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotInitialized => "not initialized",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// A live observer for one directory.
struct WatchHandle {
    directory: TrackedDirectory,
    watcher: RecommendedWatcher,
    debouncer: Arc<Debouncer>,
    stop_tx: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the observer, then wait for the worker to exit.
    async fn shutdown(self) {
        let WatchHandle {
            directory,
            watcher,
            stop_tx,
            worker,
            ..
        } = self;
        drop(watcher);
        let _ = stop_tx.send(());
        if let Err(err) = worker.await {
            tracing::error!(dir = %directory.name, error = %err, "watch worker join failure");
        }
        tracing::debug!(dir = %directory.name, "stopped watching");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectorySnapshot {
    pub name: String,
    pub path: PathBuf,
    pub watching: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_save_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce: Option<DebounceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub status: DaemonStatus,
    pub watching: usize,
    pub directories: Vec<DirectorySnapshot>,
    /// Remote URL only; the token never leaves the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

pub struct WatchController {
    registry: Arc<SharedRegistry>,
    reconciler: Arc<dyn Reconciler>,
    debounce: DebounceSettings,
    status: Mutex<DaemonStatus>,
    watches: tokio::sync::Mutex<HashMap<PathBuf, WatchHandle>>,
    dispatchers: Mutex<HashMap<PathBuf, Arc<SyncDispatcher>>>,
}

impl WatchController {
    pub fn new(
        registry: Arc<SharedRegistry>,
        reconciler: Arc<dyn Reconciler>,
        debounce: DebounceSettings,
    ) -> Self {
        let controller = Self {
            registry,
            reconciler,
            debounce,
            status: Mutex::new(DaemonStatus::NotInitialized),
            watches: tokio::sync::Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
        };
        controller.set_status(DaemonStatus::Initialized);
        tracing::info!(
            directories = controller.registry.len(),
            "watch controller initialized"
        );
        controller
    }

    pub fn status(&self) -> DaemonStatus {
        *lock(&self.status)
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// Register a directory. Does not start watching it.
    pub fn add_directory(&self, dir: TrackedDirectory) -> Result<(), DaemonError> {
        let name = dir.name.clone();
        self.registry.add_directory(dir)?;
        tracing::info!(dir = %name, "directory registered");
        Ok(())
    }

    /// Begin observing `dir`. Returns `false` when it was already observed.
    ///
    /// An unregistered directory is registered first, with a warning. Once
    /// `stop_all` has begun, no new observer is accepted.
    pub async fn start_watch(&self, dir: &TrackedDirectory) -> Result<bool, DaemonError> {
        self.ensure_accepting_watches()?;
        let dir = match self.registry.get_by_path(&dir.path) {
            Some(known) => known,
            None => {
                tracing::warn!(
                    dir = %dir.name,
                    path = %dir.path.display(),
                    "watching an unregistered directory; registering it",
                );
                self.add_directory(dir.clone())?;
                dir.clone()
            }
        };

        let mut watches = self.watches.lock().await;
        // stop_all flips the status before it drains this map.
        self.ensure_accepting_watches()?;
        if watches.contains_key(&dir.path) {
            tracing::info!(dir = %dir.name, "already watching; nothing to do");
            return Ok(false);
        }

        let handle = self.spawn_watch(dir.clone())?;
        watches.insert(dir.path.clone(), handle);
        tracing::info!(dir = %dir.name, path = %dir.path.display(), "started watching");
        Ok(true)
    }

    /// Stop observing `path` and wait until its worker has exited.
    /// Returns `false` when there was no live observer.
    pub async fn stop_watch(&self, path: &Path) -> bool {
        let handle = self.watches.lock().await.remove(path);
        match handle {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn start_all(&self) -> Result<(), DaemonError> {
        self.transition("start", &[DaemonStatus::Initialized], DaemonStatus::Starting)?;

        let directories = self.registry.directories();
        let mut failed = 0usize;
        for dir in &directories {
            if let Err(err) = self.start_watch(dir).await {
                failed += 1;
                tracing::error!(dir = %dir.name, error = %err, "could not start watching");
            }
        }

        self.set_status(DaemonStatus::Started);
        tracing::info!(
            watching = directories.len() - failed,
            failed,
            "watch controller started"
        );
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<(), DaemonError> {
        self.transition(
            "stop",
            &[DaemonStatus::Initialized, DaemonStatus::Started],
            DaemonStatus::Stopping,
        )?;

        loop {
            let next = {
                let mut watches = self.watches.lock().await;
                let key = watches.keys().next().cloned();
                key.and_then(|key| watches.remove(&key))
            };
            let Some(handle) = next else { break };
            handle.shutdown().await;
        }

        self.set_status(DaemonStatus::Stopped);
        tracing::info!("all directory watchers have been stopped and removed");
        Ok(())
    }

    /// Stop watching (if needed) and unregister.
    pub async fn remove_directory(
        &self,
        name: Option<&str>,
        path: Option<&Path>,
    ) -> Result<TrackedDirectory, DaemonError> {
        let target = match (name, path) {
            (Some(name), _) => self.registry.get_by_name(name),
            (None, Some(path)) => self.registry.get_by_path(path),
            (None, None) => None,
        };
        if let Some(dir) = &target {
            self.stop_watch(&dir.path).await;
        }

        let removed = self.registry.delete_directory(name, path)?;
        self.prune_dispatchers();
        tracing::info!(dir = %removed.name, "directory removed");
        Ok(removed)
    }

    /// Explicit sync of one tracked directory through its dispatcher.
    pub fn trigger_sync(&self, name: &str) -> Result<Dispatch, DaemonError> {
        let dir = self
            .registry
            .get_by_name(name)
            .ok_or_else(|| RegistryError::NotFound {
                selector: format!("name '{name}'"),
            })?;
        Ok(self.dispatcher_for(&dir).request("manual"))
    }

    pub fn set_remote(&self, remote: Option<GitRemote>) -> Result<(), DaemonError> {
        match &remote {
            Some(remote) => tracing::info!(url = %remote.url, "remote bound"),
            None => tracing::info!("remote cleared"),
        }
        self.registry.set_remote(remote)?;
        Ok(())
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        let watched: HashMap<PathBuf, DebounceSnapshot> = {
            let watches = self.watches.lock().await;
            watches
                .iter()
                .map(|(path, handle)| (path.clone(), handle.debouncer.snapshot()))
                .collect()
        };
        let stats: HashMap<PathBuf, SyncStats> = lock(&self.dispatchers)
            .iter()
            .map(|(path, dispatcher)| (path.clone(), dispatcher.stats()))
            .collect();

        let mut directories: Vec<DirectorySnapshot> = self
            .registry
            .directories()
            .into_iter()
            .map(|dir| DirectorySnapshot {
                watching: watched.contains_key(&dir.path),
                debounce: watched.get(&dir.path).cloned(),
                sync: stats.get(&dir.path).cloned(),
                name: dir.name.0,
                path: dir.path,
                last_save_time: dir.last_save_time,
            })
            .collect();
        directories.sort_by(|a, b| a.name.cmp(&b.name));

        ControllerSnapshot {
            status: self.status(),
            watching: watched.len(),
            directories,
            remote: self.registry.remote().map(|r| r.url.to_string()),
        }
    }

    /// Number of live observers.
    pub async fn watching(&self) -> usize {
        self.watches.lock().await.len()
    }

    fn spawn_watch(&self, dir: TrackedDirectory) -> Result<WatchHandle, DaemonError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        watcher.watch(&dir.path, RecursiveMode::Recursive)?;

        let debouncer = Arc::new(Debouncer::new(self.debounce));
        let dispatcher = self.dispatcher_for(&dir);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(watch_worker(
            dir.path.clone(),
            event_rx,
            stop_rx,
            Arc::clone(&debouncer),
            dispatcher,
        ));

        Ok(WatchHandle {
            directory: dir,
            watcher,
            debouncer,
            stop_tx,
            worker,
        })
    }

    /// Drop dispatchers of unregistered paths. One with a run in flight is
    /// kept, so a re-added path keeps its gate and never reconciles twice
    /// at once.
    fn prune_dispatchers(&self) {
        lock(&self.dispatchers).retain(|path, dispatcher| {
            self.registry.get_by_path(path).is_some() || dispatcher.stats().in_flight
        });
    }

    fn ensure_accepting_watches(&self) -> Result<(), DaemonError> {
        match self.status() {
            from @ (DaemonStatus::Stopping | DaemonStatus::Stopped) => {
                Err(DaemonError::InvalidTransition {
                    from,
                    action: "watch",
                })
            }
            _ => Ok(()),
        }
    }

    fn dispatcher_for(&self, dir: &TrackedDirectory) -> Arc<SyncDispatcher> {
        let mut dispatchers = lock(&self.dispatchers);
        Arc::clone(dispatchers.entry(dir.path.clone()).or_insert_with(|| {
            Arc::new(SyncDispatcher::new(dir.clone(), Arc::clone(&self.reconciler)))
        }))
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: &[DaemonStatus],
        next: DaemonStatus,
    ) -> Result<(), DaemonError> {
        let mut status = lock(&self.status);
        if !allowed.contains(&*status) {
            return Err(DaemonError::InvalidTransition {
                from: *status,
                action,
            });
        }
        tracing::debug!(from = %*status, to = %next, "controller transition");
        *status = next;
        Ok(())
    }

    fn set_status(&self, next: DaemonStatus) {
        *lock(&self.status) = next;
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: DaemonStatus) {
        self.set_status(status);
    }
}

async fn watch_worker(
    root: PathBuf,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut stop_rx: oneshot::Receiver<()>,
    debouncer: Arc<Debouncer>,
    dispatcher: Arc<SyncDispatcher>,
) {
    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = &mut stop_rx => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(path = %root.display(), error = %err, "watcher event error");
                        continue;
                    }
                };
                let Some(kind) = ChangeKind::classify(&root, &event) else {
                    continue;
                };
                match debouncer.on_event(Instant::now()) {
                    Decision::Fire => {
                        tracing::debug!(path = %root.display(), ?kind, "change detected");
                        dispatcher.request("watch");
                    }
                    Decision::Scheduled(at) => {
                        tracing::debug!(
                            path = %root.display(),
                            ?kind,
                            in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                            "change deferred",
                        );
                    }
                    Decision::Coalesced => {}
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if debouncer.on_timer(Instant::now()) {
                    dispatcher.request("deferred");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
