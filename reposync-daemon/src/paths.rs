use std::path::{Path, PathBuf};

pub use reposync_core::registry::{registry_path_at, root_at as reposync_root};

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const CONFIG_FILE: &str = "config.toml";

pub fn socket_path(home: &Path) -> PathBuf {
    reposync_root(home).join(DAEMON_SOCKET)
}

pub fn config_path(home: &Path) -> PathBuf {
    reposync_root(home).join(CONFIG_FILE)
}
