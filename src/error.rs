use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for incremental cache operations
pub type Result<T> = std::result::Result<T, IncrementalError>;

/// Errors raised by the incremental cache.
///
/// Stale, missing, or unparseable state files are never errors: they are
/// cache misses. Everything here either aborts the current `execute` call or
/// is an I/O failure propagated unmodified.
#[derive(Error, Debug)]
pub enum IncrementalError {
    #[error("Path does not exist: {}", path.display())]
    MissingPath { path: PathBuf },

    #[error("Path must be absolute: {}", path.display())]
    RelativePath { path: PathBuf },

    #[error(
        "Declared output {} of '{key}' does not exist after execution (state file: {})",
        path.display(),
        state_file.display()
    )]
    MissingOutput {
        key: String,
        path: PathBuf,
        state_file: PathBuf,
    },

    #[error(
        "Internal inconsistency for '{key}': {reason} (state file {} was removed)",
        state_file.display()
    )]
    InternalInconsistency {
        key: String,
        state_file: PathBuf,
        reason: String,
    },

    #[error(
        "Timed out after {waited:?} waiting for the lock of '{key}' (state file: {}). \
         Another build may still be running, or a crashed process left it locked.",
        state_file.display()
    )]
    LockTimeout {
        key: String,
        state_file: PathBuf,
        waited: Duration,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Computation for '{key}' failed")]
    Computation {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to serialize cached value for '{key}': {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl IncrementalError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
