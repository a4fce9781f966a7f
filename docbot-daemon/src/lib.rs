//! Supervisor runtime: resource watcher, per-controller work queues and
//! workers, the batch refresh ticker, and the control socket.

pub mod config;
mod error;
pub mod paths;
pub mod protocol;
pub mod queue;
mod runtime;

pub use config::ControllerConfig;
pub use error::DaemonError;
pub use protocol::{
    request_refresh, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use queue::{Backoff, WorkQueue};
pub use runtime::{read_pid, run, run_with_host, start_blocking, RefreshRecord};
