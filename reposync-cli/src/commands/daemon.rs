//! `reposync daemon`, `reposync start`, `reposync health`.

use anyhow::{Context, Result};
use clap::Subcommand;

use reposync_daemon::paths::socket_path;
use reposync_daemon::{
    request, request_status, request_stop, start_blocking, DaemonError, DaemonRequest,
};

use super::{home, print_json};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (watchers + socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}

pub fn start_watching() -> Result<()> {
    let home = home()?;
    let status = request(&home, &DaemonRequest::command("start"))
        .context("failed to start watching")?;
    println!(
        "watching {} director{}",
        status["watching"],
        if status["watching"] == 1 { "y" } else { "ies" }
    );
    Ok(())
}

pub fn health() -> Result<()> {
    let home = home()?;
    let health = request(&home, &DaemonRequest::command("health"))
        .context("daemon health check failed")?;
    print_json(&health)
}
