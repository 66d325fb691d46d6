//! `reposync sync <name>`: ask the daemon to reconcile one directory now.

use anyhow::{Context, Result};
use clap::Args;

use reposync_daemon::request_sync;

use super::home;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Name of the tracked directory.
    pub name: String,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let data = request_sync(&home, &self.name)
            .with_context(|| format!("sync failed for '{}'", self.name))?;
        match data["dispatch"].as_str() {
            Some("queued") => println!("✓ '{}' sync queued behind the running one", self.name),
            _ => println!("✓ '{}' sync started", self.name),
        }
        println!("  run `reposync daemon status` to see the outcome");
        Ok(())
    }
}
