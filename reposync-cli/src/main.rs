//! reposync: keep local directories in sync with a git remote.
//!
//! # Usage
//!
//! ```text
//! reposync daemon start|stop|status
//! reposync start
//! reposync health
//! reposync add <path> [--name <name>] [--init]
//! reposync remove (--name <name> | --path <path>)
//! reposync sync <name>
//! reposync remote set <url> --token <token>
//! reposync remote clear
//! reposync list [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    directory::{AddArgs, ListArgs, RemoveArgs},
    remote::RemoteCommand,
    sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "reposync",
    version,
    about = "Watch local directories and reconcile them with a git remote",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Begin watching every tracked directory.
    Start,

    /// Check that the daemon is alive.
    Health,

    /// Track a directory.
    Add(AddArgs),

    /// Stop tracking a directory.
    Remove(RemoveArgs),

    /// Reconcile one tracked directory with the remote now.
    Sync(SyncArgs),

    /// Bind or clear the git remote.
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },

    /// Show tracked directories (reads the registry file directly).
    List(ListArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Start => commands::daemon::start_watching(),
        Commands::Health => commands::daemon::health(),
        Commands::Add(args) => args.run(),
        Commands::Remove(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Remote { command } => commands::remote::run(command),
        Commands::List(args) => args.run(),
    }
}
