use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use reposync_core::{GitRemote, SharedRegistry, TrackedDirectory};
use reposync_sync::SyncEngine;

use crate::config::{DaemonConfig, LogFormat};
use crate::controller::{DaemonStatus, WatchController};
use crate::dispatcher::GitReconciler;
use crate::error::{io_err, DaemonError};
use crate::paths::{reposync_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Everything a socket client can reach.
pub struct DaemonContext {
    pub home: PathBuf,
    pub controller: Arc<WatchController>,
    pub engine: SyncEngine,
    pub started_at: DateTime<Utc>,
}

impl DaemonContext {
    pub fn new(home: PathBuf, controller: Arc<WatchController>, engine: SyncEngine) -> Self {
        Self {
            home,
            controller,
            engine,
            started_at: Utc::now(),
        }
    }
}

/// Load config, install logging, and block the current thread on [`run`].
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let (config, rejected) = DaemonConfig::load(home)?;
    init_tracing(&config);
    for message in &rejected {
        tracing::warn!("{message}");
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Composition root: build the single registry, engine and controller, then
/// serve the socket until `stop` or ctrl-c.
pub async fn run(home: PathBuf, config: DaemonConfig) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let engine = SyncEngine::new(config.sync_settings());
    let git_version = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.ensure_available())
            .await
            .map_err(|err| DaemonError::Protocol(format!("git probe join error: {err}")))??
    };
    tracing::info!(version = %git_version, "git available");

    let registry_path = config.registry_path(&home);
    let registry = tokio::task::spawn_blocking(move || SharedRegistry::load(registry_path))
        .await
        .map_err(|err| DaemonError::Protocol(format!("registry load join error: {err}")))?;
    let registry = Arc::new(registry);
    tracing::info!(
        path = %registry.path().display(),
        directories = registry.len(),
        "registry loaded"
    );

    let reconciler = Arc::new(GitReconciler::new(
        engine.clone(),
        Arc::clone(&registry),
        config.policy(),
    ));
    let controller = Arc::new(WatchController::new(
        registry,
        reconciler,
        config.debounce(),
    ));
    if config.autostart {
        controller.start_all().await?;
    }

    let context = Arc::new(DaemonContext::new(home, Arc::clone(&controller), engine));
    let served = serve(context).await;

    match controller.status() {
        DaemonStatus::Initialized | DaemonStatus::Started => {
            if let Err(err) = controller.stop_all().await {
                tracing::error!(error = %err, "failed to stop watchers on shutdown");
            }
        }
        other => tracing::debug!(status = %other, "controller already stopped"),
    }
    tracing::info!("daemon exited");
    served
}

/// Run the socket server and signal handler until either asks to stop.
pub async fn serve(context: Arc<DaemonContext>) -> Result<(), DaemonError> {
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    context: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = Arc::clone(&context);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = match handle_request(&context, request, &shutdown_tx).await {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => DaemonResponse::error(err.to_string()),
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Execute one control request against the controller.
pub async fn handle_request(
    context: &DaemonContext,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Value, DaemonError> {
    let controller = &context.controller;
    tracing::debug!(cmd = %request.cmd, "control request");

    match request.cmd.as_str() {
        "health" => {
            let watching = controller.watching().await;
            Ok(json!({
                "message": "OK",
                "status": controller.status(),
                "pid": std::process::id(),
                "started_at": context.started_at,
                "uptime_secs": (Utc::now() - context.started_at).num_seconds().max(0),
                "directories": controller.registry().len(),
                "watching": watching,
            }))
        }
        "status" => Ok(json!(controller.snapshot().await)),
        "start" => {
            controller.start_all().await?;
            Ok(json!(controller.snapshot().await))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        "add" => add_directory(context, request).await,
        "remove" => {
            let removed = controller
                .remove_directory(request.name.as_deref(), request.path.as_deref())
                .await?;
            Ok(json!({ "removed": removed.name.0, "path": removed.path }))
        }
        "sync" => {
            let name = request
                .name
                .ok_or_else(|| DaemonError::Protocol("sync requires 'name'".to_string()))?;
            let dispatch = controller.trigger_sync(&name)?;
            Ok(json!({ "name": name, "dispatch": dispatch }))
        }
        "set_remote" => {
            let remote = match request.url {
                Some(url) => Some(GitRemote::new(&url, request.token.unwrap_or_default())?),
                None => None,
            };
            let url = remote.as_ref().map(|r| r.url.to_string());
            controller.set_remote(remote)?;
            Ok(json!({ "remote": url }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    }
}

async fn add_directory(
    context: &DaemonContext,
    request: DaemonRequest,
) -> Result<Value, DaemonError> {
    let path = request
        .path
        .ok_or_else(|| DaemonError::Protocol("add requires 'path'".to_string()))?;
    let dir = TrackedDirectory::create(request.name.as_deref(), &path)?;

    let engine = context.engine.clone();
    let repo_path = dir.path.clone();
    let init = request.init;
    tokio::task::spawn_blocking(move || prepare_repository(&engine, &repo_path, init))
        .await
        .map_err(|err| DaemonError::Protocol(format!("repository check join error: {err}")))??;

    let controller = &context.controller;
    controller.add_directory(dir.clone())?;
    let watching = if controller.status() == DaemonStatus::Started {
        match controller.start_watch(&dir).await {
            Ok(started) => started,
            Err(DaemonError::InvalidTransition { from, .. }) => {
                tracing::info!(dir = %dir.name, status = %from, "registered but not watched");
                false
            }
            Err(err) => return Err(err),
        }
    } else {
        false
    };

    Ok(json!({
        "name": dir.name.0,
        "path": dir.path,
        "watching": watching,
    }))
}

/// `init` creates a repository when missing; otherwise a non-repository is
/// only reported, since syncs will fail until the user initializes it.
fn prepare_repository(engine: &SyncEngine, dir: &Path, init: bool) -> Result<(), DaemonError> {
    match engine.is_work_tree(dir) {
        Ok(true) => Ok(()),
        Ok(false) if init => {
            engine.init_repository(dir)?;
            Ok(())
        }
        Ok(false) => {
            tracing::warn!(path = %dir.display(), "tracked directory is not a git repository");
            Ok(())
        }
        Err(err) if init => Err(err.into()),
        Err(err) => {
            tracing::warn!(path = %dir.display(), error = %err, "could not inspect repository");
            Ok(())
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = reposync_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` wins over the configured level. Records from the `log` facade
/// (core and sync crates) are bridged in by the subscriber.
pub fn init_tracing(config: &DaemonConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
