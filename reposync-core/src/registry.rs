//! Directory registry: the tracked-directory set and the remote binding.
//!
//! # Storage layout
//!
//! ```text
//! ~/.reposync/
//!   registry.json        (mode 0600, it carries the remote access token)
//!   registry.json.tmp    (transient, renamed over registry.json on save)
//!   registry.json.corrupt (copy of an unparsable file, kept for the operator)
//! ```
//!
//! # API pattern
//!
//! Path helpers have two forms, as elsewhere in the workspace:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! [`Registry`] is the plain aggregate (`&mut self` mutations). The daemon
//! shares one [`SharedRegistry`], which puts the aggregate behind a single
//! `RwLock`: lookups run concurrently, mutations are exclusive.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, RegistryError};
use crate::types::{DirectoryName, GitRemote, TrackedDirectory, Version, CURRENT_VERSION};

pub const REGISTRY_FILE: &str = "registry.json";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.reposync/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".reposync")
}

/// `<home>/.reposync/registry.json`: pure, no I/O.
pub fn registry_path_at(home: &Path) -> PathBuf {
    root_at(home).join(REGISTRY_FILE)
}

/// `registry_path_at` convenience wrapper.
pub fn registry_path() -> Result<PathBuf, RegistryError> {
    Ok(registry_path_at(&home()?))
}

// ---------------------------------------------------------------------------
// 2. On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    version: Version,
    #[serde(default)]
    directories: Vec<TrackedDirectory>,
    #[serde(default)]
    remote: Option<GitRemote>,
}

#[derive(Serialize)]
struct RegistryFileRef<'a> {
    version: &'a Version,
    directories: &'a [TrackedDirectory],
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<&'a GitRemote>,
}

// ---------------------------------------------------------------------------
// 3. Registry aggregate
// ---------------------------------------------------------------------------

/// In-memory registry plus the file it persists to.
///
/// `by_path` and `by_name` map to positions in `directories` and are kept in
/// lockstep with it by every mutation.
#[derive(Debug, Clone)]
pub struct Registry {
    version: Version,
    directories: Vec<TrackedDirectory>,
    remote: Option<GitRemote>,
    path: PathBuf,
    by_path: HashMap<PathBuf, usize>,
    by_name: HashMap<DirectoryName, usize>,
}

impl Registry {
    /// An empty registry bound to `path`; nothing is written.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            version: CURRENT_VERSION,
            directories: Vec::new(),
            remote: None,
            path: path.into(),
            by_path: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Strict load: `RegistryNotFound` if absent, `Parse` (with line context)
    /// if malformed.
    pub fn try_load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if !path.exists() {
            return Err(RegistryError::RegistryNotFound { path });
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let file: RegistryFile = serde_json::from_str(&contents)
            .map_err(|source| RegistryError::Parse { path: path.clone(), source })?;

        let mut registry = Self::empty(path);
        registry.version = file.version;
        registry.remote = file.remote;
        for dir in file.directories {
            if registry.by_path.contains_key(&dir.path) || registry.by_name.contains_key(&dir.name)
            {
                tracing::warn!(
                    "dropping duplicate registry entry '{}' at {}",
                    dir.name,
                    dir.path.display()
                );
                continue;
            }
            registry.push(dir);
        }
        Ok(registry)
    }

    /// Self-healing load used at daemon start.
    ///
    /// A missing or unreadable file yields an empty registry that is written
    /// back immediately; an unparsable file is copied to `<file>.corrupt`
    /// first. Older format versions are stamped with [`CURRENT_VERSION`] and
    /// persisted. Never returns an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::try_load(path.clone()) {
            Ok(mut registry) => {
                if registry.version < CURRENT_VERSION {
                    tracing::info!(
                        "migrating registry {} from {} to {}",
                        path.display(),
                        registry.version,
                        CURRENT_VERSION
                    );
                    registry.version = CURRENT_VERSION;
                    if let Err(err) = registry.save() {
                        tracing::error!("failed to persist migrated registry: {err}");
                    }
                } else if registry.version > CURRENT_VERSION {
                    tracing::warn!(
                        "registry {} has newer format {} than this build ({}); loading anyway",
                        path.display(),
                        registry.version,
                        CURRENT_VERSION
                    );
                }
                registry
            }
            Err(RegistryError::RegistryNotFound { .. }) => {
                tracing::warn!(
                    "registry not found at {}; initializing an empty registry",
                    path.display()
                );
                Self::fresh(path)
            }
            Err(err) => {
                tracing::warn!("failed to load registry: {err}; initializing an empty registry");
                let backup = sibling(&path, "corrupt");
                match std::fs::copy(&path, &backup) {
                    Ok(_) => tracing::warn!("previous registry preserved at {}", backup.display()),
                    Err(copy_err) => {
                        tracing::warn!("could not preserve previous registry: {copy_err}")
                    }
                }
                Self::fresh(path)
            }
        }
    }

    fn fresh(path: PathBuf) -> Self {
        let registry = Self::empty(path);
        if let Err(err) = registry.save() {
            tracing::error!("failed to persist empty registry: {err}");
        }
        registry
    }

    /// Atomically persist `{version, directories, remote}`.
    ///
    /// Write flow: serialize → `.tmp` sibling → fsync → `chmod 0600` → `rename`.
    pub fn save(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                set_dir_permissions(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&RegistryFileRef {
            version: &self.version,
            directories: &self.directories,
            remote: self.remote.as_ref(),
        })?;

        let tmp = sibling(&self.path, "tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&tmp, e));
        }
        set_file_permissions(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&self.path, e));
        }
        Ok(())
    }

    /// Append a directory and persist.
    ///
    /// Fails with `DuplicatePath` / `DuplicateName` without touching any state.
    /// If persisting fails the append is rolled back.
    pub fn add_directory(&mut self, dir: TrackedDirectory) -> Result<(), RegistryError> {
        if self.by_path.contains_key(&dir.path) {
            return Err(RegistryError::DuplicatePath { path: dir.path });
        }
        if self.by_name.contains_key(&dir.name) {
            return Err(RegistryError::DuplicateName { name: dir.name.0 });
        }
        self.push(dir);
        if let Err(err) = self.save() {
            let last = self.directories.len() - 1;
            self.remove_at(last);
            return Err(err);
        }
        Ok(())
    }

    /// Remove one directory by name or path and persist.
    ///
    /// When both selectors are given `name` wins and a warning is logged.
    pub fn delete_directory(
        &mut self,
        name: Option<&str>,
        path: Option<&Path>,
    ) -> Result<TrackedDirectory, RegistryError> {
        let index = match (name, path) {
            (Some(name), path) => {
                if let Some(path) = path {
                    tracing::warn!(
                        "delete_directory got both name '{name}' and path {}; using the name",
                        path.display()
                    );
                }
                self.by_name
                    .get(&DirectoryName::from(name))
                    .copied()
                    .ok_or_else(|| RegistryError::NotFound {
                        selector: format!("name '{name}'"),
                    })?
            }
            (None, Some(path)) => self.position_of_path(path).ok_or_else(|| {
                RegistryError::NotFound {
                    selector: format!("path {}", path.display()),
                }
            })?,
            (None, None) => return Err(RegistryError::NoSelector),
        };

        let removed = self.remove_at(index);
        if let Err(err) = self.save() {
            self.push(removed);
            return Err(err);
        }
        Ok(removed)
    }

    /// O(1) lookup by path. The raw key is tried first, then its canonical form.
    pub fn get_by_path(&self, path: &Path) -> Option<&TrackedDirectory> {
        self.position_of_path(path).map(|i| &self.directories[i])
    }

    /// O(1) lookup by name.
    pub fn get_by_name(&self, name: &str) -> Option<&TrackedDirectory> {
        self.by_name
            .get(&DirectoryName::from(name))
            .map(|&i| &self.directories[i])
    }

    /// Replace (or clear) the remote binding and persist.
    pub fn set_remote(&mut self, remote: Option<GitRemote>) -> Result<(), RegistryError> {
        let previous = std::mem::replace(&mut self.remote, remote);
        if let Err(err) = self.save() {
            self.remote = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Stamp a successful sync on the directory at `path` and persist.
    pub fn record_save(&mut self, path: &Path, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let index = self
            .position_of_path(path)
            .ok_or_else(|| RegistryError::NotFound {
                selector: format!("path {}", path.display()),
            })?;
        let previous = self.directories[index].last_save_time.replace(at);
        if let Err(err) = self.save() {
            self.directories[index].last_save_time = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn directories(&self) -> &[TrackedDirectory] {
        &self.directories
    }

    pub fn remote(&self) -> Option<&GitRemote> {
        self.remote.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.directories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    fn position_of_path(&self, path: &Path) -> Option<usize> {
        if let Some(&i) = self.by_path.get(path) {
            return Some(i);
        }
        let canonical = std::fs::canonicalize(path).ok()?;
        self.by_path.get(&canonical).copied()
    }

    fn push(&mut self, dir: TrackedDirectory) {
        let index = self.directories.len();
        self.by_path.insert(dir.path.clone(), index);
        self.by_name.insert(dir.name.clone(), index);
        self.directories.push(dir);
    }

    /// Swap-remove `index`, re-pointing the entry that moved into the hole.
    fn remove_at(&mut self, index: usize) -> TrackedDirectory {
        let removed = self.directories.swap_remove(index);
        self.by_path.remove(&removed.path);
        self.by_name.remove(&removed.name);
        if let Some(moved) = self.directories.get(index) {
            self.by_path.insert(moved.path.clone(), index);
            self.by_name.insert(moved.name.clone(), index);
        }
        removed
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        self.by_path.len() == self.directories.len()
            && self.by_name.len() == self.directories.len()
            && self.directories.iter().enumerate().all(|(i, d)| {
                self.by_path.get(&d.path) == Some(&i) && self.by_name.get(&d.name) == Some(&i)
            })
    }
}

// ---------------------------------------------------------------------------
// 4. Shared handle
// ---------------------------------------------------------------------------

/// Process-wide registry handle, constructed once by the daemon and passed
/// around behind an `Arc`.
#[derive(Debug)]
pub struct SharedRegistry {
    inner: RwLock<Registry>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: RwLock::new(registry),
        }
    }

    /// [`Registry::load`] wrapped in a shared handle.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::new(Registry::load(path))
    }

    pub fn add_directory(&self, dir: TrackedDirectory) -> Result<(), RegistryError> {
        self.write().add_directory(dir)
    }

    pub fn delete_directory(
        &self,
        name: Option<&str>,
        path: Option<&Path>,
    ) -> Result<TrackedDirectory, RegistryError> {
        self.write().delete_directory(name, path)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<TrackedDirectory> {
        self.read().get_by_path(path).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<TrackedDirectory> {
        self.read().get_by_name(name).cloned()
    }

    pub fn set_remote(&self, remote: Option<GitRemote>) -> Result<(), RegistryError> {
        self.write().set_remote(remote)
    }

    pub fn record_save(&self, path: &Path, at: DateTime<Utc>) -> Result<(), RegistryError> {
        self.write().record_save(path, at)
    }

    /// Snapshot of the tracked directories.
    pub fn directories(&self) -> Vec<TrackedDirectory> {
        self.read().directories().to_vec()
    }

    pub fn remote(&self) -> Option<GitRemote> {
        self.read().remote().cloned()
    }

    pub fn path(&self) -> PathBuf {
        self.read().path().to_path_buf()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

/// `<path>.<suffix>` in the same directory (same filesystem, so the rename stays atomic).
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| REGISTRY_FILE.to_owned());
    path.with_file_name(format!("{name}.{suffix}"))
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _home: TempDir,
        work: TempDir,
        registry: Registry,
    }

    fn fixture() -> Fixture {
        let home = TempDir::new().expect("home");
        let work = TempDir::new().expect("work");
        let registry = Registry::empty(registry_path_at(home.path()));
        Fixture {
            _home: home,
            work,
            registry,
        }
    }

    fn tracked(work: &TempDir, name: &str) -> TrackedDirectory {
        let path = work.path().join(name);
        std::fs::create_dir_all(&path).expect("mkdir");
        TrackedDirectory::create(None, path).expect("create")
    }

    #[test]
    fn registry_path_is_correct() {
        let home = TempDir::new().unwrap();
        assert!(registry_path_at(home.path()).ends_with(".reposync/registry.json"));
    }

    #[test]
    fn add_then_lookup_by_both_keys() {
        let mut f = fixture();
        let dir = tracked(&f.work, "notes");
        f.registry.add_directory(dir.clone()).expect("add");

        assert_eq!(f.registry.get_by_name("notes"), Some(&dir));
        assert_eq!(f.registry.get_by_path(&dir.path), Some(&dir));
        assert!(f.registry.indices_consistent());
    }

    #[test]
    fn duplicate_name_rejected_without_mutation() {
        let mut f = fixture();
        f.registry.add_directory(tracked(&f.work, "a")).expect("add a");

        let other = f.work.path().join("b");
        std::fs::create_dir_all(&other).unwrap();
        let clash = TrackedDirectory::create(Some("a"), &other).unwrap();
        let err = f.registry.add_directory(clash).unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateName { .. }), "got: {err}");
        assert_eq!(f.registry.len(), 1);
        assert!(f.registry.get_by_path(&other).is_none());
        assert!(f.registry.indices_consistent());
    }

    #[test]
    fn delete_swap_remove_keeps_indices_consistent() {
        let mut f = fixture();
        for name in ["a", "b", "c", "d"] {
            f.registry.add_directory(tracked(&f.work, name)).unwrap();
        }

        let removed = f.registry.delete_directory(Some("a"), None).unwrap();
        assert_eq!(removed.name.0, "a");
        assert!(f.registry.indices_consistent());

        let c_path = f.registry.get_by_name("c").unwrap().path.clone();
        f.registry.delete_directory(None, Some(&c_path)).unwrap();
        assert!(f.registry.indices_consistent());
        assert_eq!(f.registry.len(), 2);
        assert!(f.registry.get_by_name("c").is_none());
        assert!(f.registry.get_by_path(&c_path).is_none());
    }

    #[test]
    fn delete_prefers_name_when_both_given() {
        let mut f = fixture();
        let a = tracked(&f.work, "a");
        let b = tracked(&f.work, "b");
        f.registry.add_directory(a).unwrap();
        f.registry.add_directory(b.clone()).unwrap();

        let removed = f
            .registry
            .delete_directory(Some("a"), Some(&b.path))
            .unwrap();
        assert_eq!(removed.name.0, "a");
        assert!(f.registry.get_by_name("b").is_some());
    }

    #[test]
    fn delete_errors() {
        let mut f = fixture();
        assert!(matches!(
            f.registry.delete_directory(None, None),
            Err(RegistryError::NoSelector)
        ));
        assert!(matches!(
            f.registry.delete_directory(Some("ghost"), None),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn record_save_stamps_and_persists() {
        let mut f = fixture();
        let dir = tracked(&f.work, "a");
        f.registry.add_directory(dir.clone()).unwrap();

        let at = Utc::now();
        f.registry.record_save(&dir.path, at).unwrap();

        let reloaded = Registry::try_load(f.registry.path()).unwrap();
        let stamped = reloaded.get_by_name("a").unwrap().last_save_time.unwrap();
        assert_eq!(stamped.timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn load_drops_duplicate_entries() {
        let f = fixture();
        let path = f.registry.path().to_path_buf();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"version":"1.0.0","directories":[
                {"name":"a","path":"/x/a"},
                {"name":"a","path":"/x/b"},
                {"name":"c","path":"/x/a"}
            ]}"#,
        )
        .unwrap();

        let loaded = Registry::try_load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.indices_consistent());
    }

    #[test]
    fn old_version_is_migrated_on_load() {
        let f = fixture();
        let path = f.registry.path().to_path_buf();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"version":"0.9.0","directories":[]}"#).unwrap();

        let loaded = Registry::load(&path);
        assert_eq!(loaded.version(), CURRENT_VERSION);
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("\"1.0.0\""));
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let mut f = fixture();
        f.registry.add_directory(tracked(&f.work, "a")).unwrap();
        let tmp = sibling(f.registry.path(), "tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn shared_registry_reads_see_mutations() {
        let f = fixture();
        let shared = SharedRegistry::new(f.registry.clone());
        let dir = tracked(&f.work, "shared");
        shared.add_directory(dir.clone()).unwrap();

        assert_eq!(shared.get_by_path(&dir.path), Some(dir.clone()));
        assert_eq!(shared.directories(), vec![dir]);
        shared.delete_directory(Some("shared"), None).unwrap();
        assert!(shared.is_empty());
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(RegistryError::HomeNotFound.to_string().contains("home directory"));
    }
}
