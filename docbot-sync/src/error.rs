//! Error types for docbot-sync.

use thiserror::Error;

use docbot_core::StoreError;

/// Failures talking to the repository host. All are treated as transient.
#[derive(Debug, Error)]
pub enum HostError {
    /// The request never produced an HTTP response.
    #[error("repository host unavailable: {0}")]
    Unavailable(String),

    /// The host answered with a non-success status.
    #[error("repository host returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// The response body was not the expected shape.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
}

/// All errors surfaced by reconcile passes and refreshes.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the resource store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An error from the repository host.
    #[error("host error: {0}")]
    Host(#[from] HostError),
}
