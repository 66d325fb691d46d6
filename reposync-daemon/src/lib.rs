//! reposync daemon: watch controller, debouncing, sync dispatch and the
//! Unix-socket control surface.

pub mod config;
pub mod controller;
pub mod debounce;
pub mod dispatcher;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use config::{DaemonConfig, LogFormat};
pub use controller::{ControllerSnapshot, DaemonStatus, DirectorySnapshot, WatchController};
pub use debounce::{ChangeKind, DebounceSettings, Debouncer, Decision};
pub use dispatcher::{Dispatch, GitReconciler, Reconciler, SyncDispatcher, SyncStats};
pub use error::DaemonError;
pub use protocol::{
    request, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{handle_request, init_tracing, run, serve, start_blocking, DaemonContext};
