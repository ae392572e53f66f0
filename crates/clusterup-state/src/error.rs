//! Error types for run-state storage.

use std::io;
use std::path::PathBuf;

/// Errors raised while reading, writing or locking a run-state file.
///
/// Any of these breaks resumability, so callers surface them instead of
/// logging and continuing.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for state lock {path}")]
    LockTimeout { path: PathBuf },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StateError::Json {
            path: path.into(),
            source,
        }
    }
}
