//! Optimizer and scanner errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizeError {
    /// Bare imports that resolved nowhere; fatal to the optimizer, listed
    /// all at once for diagnostics.
    #[error("failed to resolve dependencies:\n{listing}\n\nHint: install the missing packages, or add them to optimizeDeps.exclude if they are provided at runtime")]
    MissingDeps { listing: String },

    /// A scan entry glob did not parse.
    #[error("invalid entry pattern '{pattern}': {message}\n\nHint: optimizeDeps.entries uses globset syntax")]
    InvalidEntryPattern { pattern: String, message: String },

    /// A dependency source could not be parsed even with the JSX loader.
    #[error("failed to parse dependency '{dep}': {message}")]
    DepParse { dep: String, message: String },

    /// I/O around the cache directory or dependency sources.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// The external bundler backend failed.
    #[error("bundler backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = OptimizeError> = std::result::Result<T, E>;
