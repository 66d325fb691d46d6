//! `reposync remote set|clear`

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use reposync_daemon::{request, DaemonRequest};

use super::home;

#[derive(Subcommand, Debug)]
pub enum RemoteCommand {
    /// Bind the remote every tracked directory reconciles against.
    Set(SetArgs),
    /// Forget the remote; directories fall back to their own git config.
    Clear,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    /// http(s) URL of the remote repository.
    pub url: String,

    /// Access token sent as the HTTP password. Stored in the registry file.
    /// Read from `REPOSYNC_TOKEN`, or from the first line of stdin, when
    /// omitted; passing it here leaves it visible in the process list.
    #[arg(long, env = "REPOSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl SetArgs {
    fn resolve_token(&self) -> Result<String> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(token.trim().to_string());
        }
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read token from stdin")?;
        let token = line.trim();
        if token.is_empty() {
            bail!("no access token: pass --token, set REPOSYNC_TOKEN, or pipe it on stdin");
        }
        Ok(token.to_string())
    }
}

pub fn run(command: RemoteCommand) -> Result<()> {
    let home = home()?;
    match command {
        RemoteCommand::Set(args) => {
            let token = args.resolve_token()?;
            let data = request(
                &home,
                &DaemonRequest {
                    url: Some(args.url.clone()),
                    token: Some(token),
                    ..DaemonRequest::command("set_remote")
                },
            )
            .with_context(|| format!("failed to bind remote {}", args.url))?;
            println!("✓ remote set to {}", data["remote"].as_str().unwrap_or(&args.url));
        }
        RemoteCommand::Clear => {
            request(&home, &DaemonRequest::command("set_remote"))
                .context("failed to clear remote")?;
            println!("✓ remote cleared");
        }
    }
    Ok(())
}
