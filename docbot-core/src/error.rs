//! Error types for docbot-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ObjectKey;

/// A pull request URL that does not name a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// The URL is unparsable or its path is not `/<org>/<repo>/pull/<number>`.
    #[error("malformed pull request reference '{url}': {reason}")]
    Malformed { url: String, reason: String },
}

impl ReferenceError {
    pub(crate) fn malformed(url: &str, reason: impl Into<String>) -> Self {
        ReferenceError::Malformed {
            url: url.to_owned(),
            reason: reason.into(),
        }
    }
}

/// All errors that can arise from resource store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A stored resource could not be decoded.
    #[error("failed to parse resource at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The resource does not exist (deleted, or never created).
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    /// A create raced with another create of the same key.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The write was based on a stale read.
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        expected: u64,
        found: u64,
    },

    /// An unsafe key, or an update that would change an immutable field.
    #[error("invalid {kind} {key}: {reason}")]
    Invalid {
        kind: &'static str,
        key: ObjectKey,
        reason: String,
    },

    #[error("invalid namespace: {reason}")]
    InvalidNamespace { reason: String },
}

impl StoreError {
    /// `true` for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
