//! reposync core library: domain types, registry persistence, errors.
//!
//! - [`types`]: tracked directories, the remote binding, format version
//! - [`error`]: [`RegistryError`], [`ValidationError`]
//! - [`registry`]: load / save / add / delete, plus the shared handle

pub mod error;
pub mod registry;
pub mod types;

pub use error::{RegistryError, ValidationError};
pub use registry::{Registry, SharedRegistry};
pub use types::{DirectoryName, GitRemote, TrackedDirectory, Version, CURRENT_VERSION};
