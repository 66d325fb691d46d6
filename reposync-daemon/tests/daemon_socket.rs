//! End-to-end: boot the daemon in a temp home and drive it over its socket.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use reposync_daemon::paths::socket_path;
use reposync_daemon::{request, run, DaemonConfig, DaemonRequest};
use serde_json::Value;
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn call(home: PathBuf, req: DaemonRequest) -> Result<Value, String> {
    tokio::task::spawn_blocking(move || request(&home, &req).map_err(|e| e.to_string()))
        .await
        .expect("client join")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_serves_control_requests_until_stopped() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    let notes = work.path().join("notes");
    std::fs::create_dir(&notes).unwrap();

    let config = DaemonConfig {
        cooldown_secs: 1,
        ..DaemonConfig::default()
    };
    let daemon = tokio::spawn(run(home.path().to_path_buf(), config));

    let socket = socket_path(home.path());
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(socket.exists(), "daemon socket never appeared");

    let home_path = home.path().to_path_buf();
    let health = call(home_path.clone(), DaemonRequest::command("health"))
        .await
        .unwrap();
    assert_eq!(health["message"], "OK");
    assert_eq!(health["status"], "started");

    let added = call(
        home_path.clone(),
        DaemonRequest {
            path: Some(notes.clone()),
            init: true,
            ..DaemonRequest::command("add")
        },
    )
    .await
    .unwrap();
    assert_eq!(added["name"], "notes");
    assert_eq!(added["watching"], true);
    assert!(notes.join(".git").exists(), "--init should create a repository");

    let duplicate = call(
        home_path.clone(),
        DaemonRequest {
            path: Some(notes.clone()),
            ..DaemonRequest::command("add")
        },
    )
    .await
    .unwrap_err();
    assert!(duplicate.contains("already tracked"), "got: {duplicate}");

    let status = call(home_path.clone(), DaemonRequest::command("status"))
        .await
        .unwrap();
    assert_eq!(status["watching"], 1);
    assert_eq!(status["directories"][0]["name"], "notes");

    let sync = call(
        home_path.clone(),
        DaemonRequest {
            name: Some("notes".to_string()),
            ..DaemonRequest::command("sync")
        },
    )
    .await
    .unwrap();
    assert_eq!(sync["name"], "notes");

    let removed = call(
        home_path.clone(),
        DaemonRequest {
            name: Some("notes".to_string()),
            ..DaemonRequest::command("remove")
        },
    )
    .await
    .unwrap();
    assert_eq!(removed["removed"], "notes");

    call(home_path.clone(), DaemonRequest::command("stop"))
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon should exit after stop")
        .expect("daemon join");
    assert!(result.is_ok(), "daemon exited with {result:?}");
    assert!(!socket.exists(), "socket is removed on shutdown");

    let raw = std::fs::read_to_string(home.path().join(".reposync/registry.json")).unwrap();
    let registry: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(registry["directories"].as_array().map(Vec::len), Some(0));
}
