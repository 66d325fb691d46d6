//! Per-directory change debouncing.
//!
//! The [`Debouncer`] is a pure clock-driven state machine: the watch worker
//! feeds it `on_event(now)` for each qualifying filesystem change and
//! `on_timer(now)` when the scheduled deadline elapses. It never sleeps or
//! spawns; the worker owns the timer.

use std::path::{Component, Path};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind};
use serde::Serialize;
use tokio::time::Instant;

/// The closed set of changes that can trigger a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl ChangeKind {
    /// Map a raw notify event for a directory rooted at `root`.
    ///
    /// Access events, directory-level events and anything inside a `.git`
    /// directory yield `None`.
    pub fn classify(root: &Path, event: &Event) -> Option<Self> {
        let kind = match event.kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
                return None
            }
            EventKind::Create(_) => Self::Created,
            EventKind::Modify(ModifyKind::Name(_)) => Self::Moved,
            EventKind::Modify(_) => Self::Modified,
            EventKind::Remove(_) => Self::Deleted,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => return None,
        };

        let relevant = event
            .paths
            .iter()
            .any(|path| !path.is_dir() && !inside_git_dir(root, path));
        relevant.then_some(kind)
    }
}

fn inside_git_dir(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub cooldown: Duration,
    /// When `false` every qualifying event fires immediately.
    pub limit_save_intervals: bool,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            limit_save_intervals: true,
        }
    }
}

/// What the caller should do after [`Debouncer::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch a sync now.
    Fire,
    /// A deferred fire is now scheduled for this instant.
    Scheduled(Instant),
    /// Folded into the already scheduled deferred fire.
    Coalesced,
}

#[derive(Debug, Default)]
struct DebounceState {
    last_fired_at: Option<Instant>,
    deferred_at: Option<Instant>,
    fired: u64,
    coalesced: u64,
}

/// Status-payload view of a debouncer.
#[derive(Debug, Clone, Serialize)]
pub struct DebounceSnapshot {
    pub cooldown_secs: u64,
    pub limit_save_intervals: bool,
    pub pending: bool,
    pub fired: u64,
    pub coalesced: u64,
}

#[derive(Debug)]
pub struct Debouncer {
    settings: DebounceSettings,
    state: Mutex<DebounceState>,
}

impl Debouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(DebounceState::default()),
        }
    }

    pub fn on_event(&self, now: Instant) -> Decision {
        let mut state = self.lock();
        if !self.settings.limit_save_intervals {
            fire(&mut state, now);
            return Decision::Fire;
        }

        match state.last_fired_at {
            Some(last) if now.duration_since(last) < self.settings.cooldown => {
                if state.deferred_at.is_some() {
                    state.coalesced += 1;
                    Decision::Coalesced
                } else {
                    let at = last + self.settings.cooldown;
                    state.deferred_at = Some(at);
                    Decision::Scheduled(at)
                }
            }
            _ => {
                // Any deferred fire is subsumed by this one.
                fire(&mut state, now);
                Decision::Fire
            }
        }
    }

    /// `true` when the deferred fire was due and has been consumed.
    pub fn on_timer(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match state.deferred_at {
            Some(at) if at <= now => {
                fire(&mut state, now);
                true
            }
            _ => false,
        }
    }

    /// The outstanding deferred fire, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deferred_at
    }

    pub fn snapshot(&self) -> DebounceSnapshot {
        let state = self.lock();
        DebounceSnapshot {
            cooldown_secs: self.settings.cooldown.as_secs(),
            limit_save_intervals: self.settings.limit_save_intervals,
            pending: state.deferred_at.is_some(),
            fired: state.fired,
            coalesced: state.coalesced,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fire(state: &mut DebounceState, now: Instant) {
    state.last_fired_at = Some(now);
    state.deferred_at = None;
    state.fired += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, RenameMode};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::time::advance;

    fn limited(secs: u64) -> Debouncer {
        Debouncer::new(DebounceSettings {
            cooldown: Duration::from_secs(secs),
            limit_save_intervals: true,
        })
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn burst_inside_window_fires_once_then_trails() {
        let debouncer = limited(5);
        let start = Instant::now();
        let mut immediate = 0;

        for _ in 0..10 {
            if debouncer.on_event(Instant::now()) == Decision::Fire {
                immediate += 1;
            }
            advance(Duration::from_millis(400)).await;
        }
        assert_eq!(immediate, 1, "burst should produce one trigger inside the window");
        assert_eq!(debouncer.deadline(), Some(start + Duration::from_secs(5)));
        assert!(!debouncer.on_timer(Instant::now()), "deadline not reached yet");

        advance(Duration::from_secs(1)).await;
        assert!(debouncer.on_timer(Instant::now()), "one trailing trigger at window end");
        assert!(!debouncer.on_timer(Instant::now()), "trailing trigger is consumed");

        let snap = debouncer.snapshot();
        assert_eq!(snap.fired, 2);
        assert_eq!(snap.coalesced, 8);
        assert!(!snap.pending);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn events_past_cooldown_fire_immediately() {
        let debouncer = limited(5);
        assert_eq!(debouncer.on_event(Instant::now()), Decision::Fire);
        advance(Duration::from_secs(6)).await;
        assert_eq!(debouncer.on_event(Instant::now()), Decision::Fire);
        assert_eq!(debouncer.deadline(), None);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn late_event_subsumes_unprocessed_deferred_fire() {
        let debouncer = limited(5);
        debouncer.on_event(Instant::now());
        advance(Duration::from_secs(1)).await;
        assert!(matches!(debouncer.on_event(Instant::now()), Decision::Scheduled(_)));

        advance(Duration::from_secs(5)).await;
        assert_eq!(debouncer.on_event(Instant::now()), Decision::Fire);
        assert_eq!(debouncer.deadline(), None);
        assert!(!debouncer.on_timer(Instant::now()));
    }

    #[test]
    fn unlimited_debouncer_fires_every_event() {
        let debouncer = Debouncer::new(DebounceSettings {
            cooldown: Duration::from_secs(5),
            limit_save_intervals: false,
        });
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(debouncer.on_event(now), Decision::Fire);
        }
        assert_eq!(debouncer.snapshot().fired, 3);
    }

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    #[test]
    fn classify_maps_kinds_and_skips_noise() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("notes.md");
        let sub = root.path().join("drafts");
        std::fs::create_dir(&sub).unwrap();

        let modified = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            file.clone(),
        );
        assert_eq!(ChangeKind::classify(root.path(), &modified), Some(ChangeKind::Modified));

        let renamed = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), file.clone());
        assert_eq!(ChangeKind::classify(root.path(), &renamed), Some(ChangeKind::Moved));

        let removed = event(EventKind::Remove(RemoveKind::File), file.clone());
        assert_eq!(ChangeKind::classify(root.path(), &removed), Some(ChangeKind::Deleted));

        let accessed = event(EventKind::Access(AccessKind::Read), file);
        assert_eq!(ChangeKind::classify(root.path(), &accessed), None);

        let folder = event(EventKind::Create(CreateKind::Folder), sub.clone());
        assert_eq!(ChangeKind::classify(root.path(), &folder), None);

        let dir_touch = event(EventKind::Modify(ModifyKind::Any), sub);
        assert_eq!(ChangeKind::classify(root.path(), &dir_touch), None);

        let git_internal = event(
            EventKind::Create(CreateKind::File),
            root.path().join(".git").join("index.lock"),
        );
        assert_eq!(ChangeKind::classify(root.path(), &git_internal), None);
    }
}
