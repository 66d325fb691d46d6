//! Bounded `git` invocations.
//!
//! Every call runs with `current_dir` set to the target directory (the
//! daemon's own working directory is never touched), with terminal prompts
//! disabled, and under a deadline after which the child is killed.
//!
//! Credentials travel through `GIT_CONFIG_*` environment variables scoped to
//! the single child process: they never appear on a command line and are
//! never written to `.git/config`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use reposync_core::GitRemote;

use crate::error::SyncError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Environment variable the inline credential helper reads the token from.
const TOKEN_ENV: &str = "REPOSYNC_ACCESS_TOKEN";
const USER_ENV: &str = "REPOSYNC_ACCESS_USER";

/// Captured result of one finished git process.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// The tool's own message: stderr when present, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// A git executable plus the deadline applied to each call.
#[derive(Debug, Clone)]
pub struct Git {
    program: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run `git <args>` in `dir`. A non-zero exit is returned as output, not
    /// as an error; only launch failures and timeouts are errors.
    pub fn run(
        &self,
        dir: &Path,
        args: &[&str],
        auth: Option<&GitRemote>,
    ) -> Result<GitOutput, SyncError> {
        self.run_with_env(dir, args, auth, &[])
    }

    pub fn run_with_env(
        &self,
        dir: &Path,
        args: &[&str],
        auth: Option<&GitRemote>,
        env: &[(&str, &str)],
    ) -> Result<GitOutput, SyncError> {
        let command = self.describe(args);
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(remote) = auth.filter(|r| !r.access_token.is_empty()) {
            apply_credentials(&mut cmd, remote);
        }

        tracing::debug!("running `{command}` in {}", dir.display());
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound && dir.is_dir() {
                SyncError::GitUnavailable {
                    program: self.program.clone(),
                }
            } else {
                SyncError::Spawn {
                    command: command.clone(),
                    dir: dir.to_path_buf(),
                    source,
                }
            }
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait_with_deadline(&mut child) {
            Ok(Some(status)) => status,
            Ok(None) => {
                // Readers are left detached: a grandchild may still hold the pipes.
                return Err(SyncError::Timeout {
                    command,
                    dir: dir.to_path_buf(),
                    after: self.timeout,
                });
            }
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SyncError::Spawn {
                    command,
                    dir: dir.to_path_buf(),
                    source,
                });
            }
        };

        Ok(GitOutput {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    /// `Ok(None)` when the deadline passed; the child has been killed and reaped.
    fn wait_with_deadline(&self, child: &mut Child) -> std::io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(args.iter().map(|a| (*a).to_owned()));
        parts.join(" ")
    }
}

/// Clear any configured helpers, then install one that answers from env.
fn apply_credentials(cmd: &mut Command, remote: &GitRemote) {
    let user = if remote.url.username().is_empty() {
        "x-access-token"
    } else {
        remote.url.username()
    };
    let helper = format!(
        "!f() {{ echo \"username=${USER_ENV}\"; echo \"password=${TOKEN_ENV}\"; }}; f"
    );
    cmd.env("GIT_CONFIG_COUNT", "2")
        .env("GIT_CONFIG_KEY_0", "credential.helper")
        .env("GIT_CONFIG_VALUE_0", "")
        .env("GIT_CONFIG_KEY_1", "credential.helper")
        .env("GIT_CONFIG_VALUE_1", helper)
        .env(USER_ENV, user)
        .env(TOKEN_ENV, &remote.access_token);
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = reader
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
