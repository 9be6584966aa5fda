//! Error types surfaced by the public API.
//!
//! Internal plumbing (HTTP, archive extraction) reports `anyhow` errors with
//! context; they are mapped onto these kinds at the fetcher and store
//! boundaries so callers can match on the failure programmatically.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by plugin manager operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A public method was called with a name that is not a valid package name.
    #[error("invalid plugin name '{name}': {reason}")]
    InvalidPluginName {
        /// The offending input.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No package satisfies the requested name and selector.
    #[error("package '{name}@{selector}' not found: {message}")]
    NotFound {
        /// Requested package name.
        name: String,
        /// Requested selector (range, ref, or path).
        selector: String,
        /// Resolver detail.
        message: String,
    },

    /// A network or HTTP status failure from a fetcher.
    #[error("fetch failed for '{name}': {source}")]
    FetchFailed {
        /// Package being fetched.
        name: String,
        /// Underlying transport error.
        #[source]
        source: anyhow::Error,
    },

    /// A dependency selector cannot be satisfied given host or static constraints.
    #[error("version conflict for '{name}': required '{required}', available '{available}'")]
    VersionConflict {
        /// Dependency name.
        name: String,
        /// Selector declared by the dependent.
        required: String,
        /// What the store or host could offer.
        available: String,
    },

    /// The loader could not resolve a `require` call.
    #[error("cannot resolve module '{request}' from '{from}'")]
    ModuleNotFound {
        /// The `require` argument.
        request: String,
        /// The requiring file or plugin.
        from: String,
    },

    /// Plugin code threw during evaluation.
    #[error("plugin code failed in '{context}': {message}")]
    ExecutionError {
        /// File or script being evaluated.
        context: String,
        /// The thrown value, rendered.
        message: String,
    },

    /// The store lock could not be acquired within `lock_wait`.
    #[error("plugin store is locked by another operation (lock file {lock_file:?})")]
    LockBusy {
        /// Path of the sentinel file.
        lock_file: PathBuf,
    },

    /// A `package.json` was missing or malformed.
    #[error("bad manifest for '{name}': {message}")]
    Manifest {
        /// Package name (or path when the name is unknown).
        name: String,
        /// What was wrong.
        message: String,
    },

    /// Filesystem failure inside the store.
    #[error("I/O error at {path:?}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PluginError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the error is one a missing optional dependency may swallow.
    pub fn is_optional_skippable(&self) -> bool {
        matches!(
            self,
            PluginError::NotFound { .. } | PluginError::FetchFailed { .. }
        )
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = PluginError> = std::result::Result<T, E>;
