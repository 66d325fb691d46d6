//! `reposync add`, `reposync remove`, `reposync list`

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use reposync_core::{Registry, RegistryError};
use reposync_daemon::{request, DaemonConfig, DaemonRequest};

use super::{home, print_json};

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Directory to track.
    pub path: PathBuf,

    /// Label for the directory; defaults to its final path segment.
    #[arg(long)]
    pub name: Option<String>,

    /// Run `git init` when the directory is not a repository yet.
    #[arg(long)]
    pub init: bool,
}

impl AddArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let path = std::fs::canonicalize(&self.path)
            .with_context(|| format!("cannot resolve {}", self.path.display()))?;
        let data = request(
            &home,
            &DaemonRequest {
                path: Some(path.clone()),
                name: self.name,
                init: self.init,
                ..DaemonRequest::command("add")
            },
        )
        .with_context(|| format!("failed to add {}", path.display()))?;

        let name = data["name"].as_str().unwrap_or_default();
        let state = if data["watching"] == true {
            "watching"
        } else {
            "registered"
        };
        println!("✓ '{name}' {state} ({})", path.display());
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Name of the tracked directory.
    #[arg(long, conflicts_with = "path", required_unless_present = "path")]
    pub name: Option<String>,

    /// Path of the tracked directory.
    #[arg(long)]
    pub path: Option<PathBuf>,
}

impl RemoveArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let path = self
            .path
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
        let data = request(
            &home,
            &DaemonRequest {
                name: self.name,
                path,
                ..DaemonRequest::command("remove")
            },
        )
        .context("failed to remove directory")?;
        println!(
            "✓ '{}' is no longer tracked",
            data["removed"].as_str().unwrap_or_default()
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ListJson {
    registry: PathBuf,
    remote: Option<String>,
    directories: Vec<DirectoryJson>,
}

#[derive(Serialize)]
struct DirectoryJson {
    name: String,
    path: PathBuf,
    last_save_time: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct DirectoryRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
}

impl ListArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let (config, rejected) = DaemonConfig::load(&home).context("failed to load config")?;
        for message in &rejected {
            eprintln!("warning: {message}");
        }
        let path = config.registry_path(&home);

        let registry = match Registry::try_load(&path) {
            Ok(registry) => registry,
            Err(RegistryError::RegistryNotFound { .. }) => Registry::empty(&path),
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read {}", path.display()))
            }
        };

        let listing = ListJson {
            registry: path,
            remote: registry.remote().map(|r| r.url.to_string()),
            directories: registry
                .directories()
                .iter()
                .map(|d| DirectoryJson {
                    name: d.name.0.clone(),
                    path: d.path.clone(),
                    last_save_time: d.last_save_time,
                })
                .collect(),
        };

        if self.json {
            return print_json(&listing);
        }
        print_table(listing, Utc::now());
        Ok(())
    }
}

fn print_table(listing: ListJson, now: DateTime<Utc>) {
    println!(
        "reposync v{} | {} tracked | remote: {}",
        env!("CARGO_PKG_VERSION"),
        listing.directories.len(),
        match &listing.remote {
            Some(url) => url.green().to_string(),
            None => "none".bright_black().to_string(),
        },
    );

    if listing.directories.is_empty() {
        println!("No directories tracked.");
        println!("Run: reposync add <path>");
        return;
    }

    let mut rows: Vec<DirectoryRow> = listing
        .directories
        .into_iter()
        .map(|d| DirectoryRow {
            name: d.name,
            path: d.path.display().to_string(),
            last_sync: d
                .last_save_time
                .map(|t| format_age(now, t))
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

/// Coarse "N units ago" rendering.
fn format_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
