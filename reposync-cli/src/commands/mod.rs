pub mod daemon;
pub mod directory;
pub mod remote;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}
