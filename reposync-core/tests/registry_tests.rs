//! Registry error-message, atomic-write-safety, and self-healing load tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use reposync_core::{registry, Registry, RegistryError, TrackedDirectory};
use std::fs;

fn registry_in(home: &assert_fs::TempDir) -> std::path::PathBuf {
    registry::registry_path_at(home.path())
}

// ---------------------------------------------------------------------------
// 1. Load error messages (strict path)
// ---------------------------------------------------------------------------

#[test]
fn try_load_missing_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = Registry::try_load(registry_in(&home)).unwrap_err();
    assert!(matches!(err, RegistryError::RegistryNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("registry.json"));
}

#[test]
fn try_load_corrupt_json_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = registry_in(&home);
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(&path, b"{ \"version\": \"1.0.0\", \"directories\": [ broken").expect("write");

    let err = Registry::try_load(&path).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("registry.json"), "must contain file path");
}

// ---------------------------------------------------------------------------
// 2. Self-healing load
// ---------------------------------------------------------------------------

#[test]
fn load_missing_file_creates_and_persists_empty_registry() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = registry_in(&home);

    let registry = Registry::load(&path);
    assert!(registry.is_empty());
    home.child(".reposync/registry.json")
        .assert(predicate::path::exists());

    let reloaded = Registry::try_load(&path).expect("persisted registry parses");
    assert!(reloaded.is_empty());
}

#[test]
fn load_corrupt_file_preserves_copy_and_recovers() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = registry_in(&home);
    fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
    fs::write(&path, b"not json at all").expect("write");

    let registry = Registry::load(&path);
    assert!(registry.is_empty());

    home.child(".reposync/registry.json.corrupt")
        .assert("not json at all");
    Registry::try_load(&path).expect("corrupt file replaced with a valid one");
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let work = assert_fs::TempDir::new().expect("work");
    let notes = work.child("notes");
    notes.create_dir_all().unwrap();

    let path = registry_in(&home);
    let mut registry = Registry::load(&path);
    registry
        .add_directory(TrackedDirectory::create(None, notes.path()).unwrap())
        .expect("add");
    let original = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = path.with_file_name("registry.json.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    assert_eq!(original, fs::read(&path).expect("read after crash"));
    let reloaded = Registry::try_load(&path).expect("original still parses");
    assert_eq!(reloaded.len(), 1);
}

#[cfg(unix)]
#[test]
fn registry_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = registry_in(&home);
    Registry::load(&path);
    let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
}

// ---------------------------------------------------------------------------
// 4. Registration scenario
// ---------------------------------------------------------------------------

#[test]
fn register_without_name_then_duplicate_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let data = assert_fs::TempDir::new().expect("data");
    let notes = data.child("notes");
    notes.create_dir_all().unwrap();

    let mut registry = Registry::load(registry_in(&home));
    let first = TrackedDirectory::create(None, notes.path()).unwrap();
    assert_eq!(first.name.0, "notes");
    registry.add_directory(first).expect("first add");

    let again = TrackedDirectory::create(None, notes.path()).unwrap();
    let err = registry.add_directory(again).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicatePath { .. }), "got: {err}");
    assert!(err.to_string().contains("already tracked"));

    let reloaded = Registry::try_load(registry_in(&home)).unwrap();
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn delete_unknown_reports_selector() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut registry = Registry::load(registry_in(&home));
    let err = registry
        .delete_directory(None, Some(std::path::Path::new("/definitely/not/here")))
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }));
    assert!(err.to_string().contains("/definitely/not/here"));
}
