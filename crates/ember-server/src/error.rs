//! Error types for the serving core.
//!
//! Follows a hierarchical layout: `ServerError` is the broad top-level type,
//! `TransformError` covers per-request pipeline failures (and is cloneable so
//! deduplicated waiters can all observe the same outcome), `LexError` covers
//! hot-accept argument lexing. User-facing variants carry `Hint:` guidance.

use thiserror::Error;

/// Top-level server error.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A transform pipeline failure.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    /// Module graph errors.
    #[error("graph error: {0}")]
    Graph(#[from] ember_graph::GraphError),

    /// Invalid glob pattern registered as a glob importer.
    #[error("invalid glob pattern '{pattern}': {message}\n\nHint: glob imports use globset syntax, e.g. \"./modules/*.js\"")]
    InvalidGlob { pattern: String, message: String },

    /// File watcher errors.
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O errors from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else.
    #[error("{0}")]
    Custom(String),
}

/// Per-request transform pipeline failure.
///
/// Cloneable by design: the request-dedup map hands the same outcome to every
/// waiter attached to an in-flight computation.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// A plugin hook returned an error.
    #[error("plugin '{plugin}' failed in {hook} hook for {id}: {message}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        id: String,
        message: String,
    },

    /// A file was present but unreadable (non-ENOENT).
    #[error("failed to load {id}: {message}")]
    Load { id: String, message: String },

    /// Importing a public-directory file from source code.
    #[error("{url} is inside the public directory and must not be imported from source code.\n\nHint: assets in the public directory are served verbatim at the server root; reference it as '{suggestion}' from HTML, or move the file into the source tree to import it")]
    PublicPathMisuse { url: String, suggestion: String },

    /// Hot-accept argument lexing failed.
    #[error("failed to parse hot-accept deps in {id}: {source}")]
    Lex {
        id: String,
        #[source]
        source: LexError,
    },

    /// Graph bookkeeping failed mid-pipeline.
    #[error("graph error while transforming: {0}")]
    Graph(#[from] ember_graph::GraphError),

    /// The in-flight computation this request attached to went away without
    /// producing a result.
    #[error("transform of {url} was interrupted; retry the request")]
    Interrupted { url: String },
}

/// Hot-accept lexer errors, with byte positions into the source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    /// `${` inside a template-literal dep; accepted deps must be literal.
    #[error("hot-accept deps must be string literals, found template interpolation at byte {pos}")]
    TemplateInterpolation { pos: usize },

    /// Something other than a string literal inside the dep array.
    #[error("unexpected character '{ch}' in hot-accept dep array at byte {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    /// The call never closed.
    #[error("unterminated hot-accept call starting at byte {pos}")]
    Unterminated { pos: usize },
}

/// A transform request waited out the pending pre-bundle reload window.
#[derive(Debug, Clone, Error)]
#[error("request timed out waiting for dependency pre-bundling to finish\n\nHint: a newly discovered dependency triggered a re-bundle; reload the page")]
pub struct PendingReloadTimeout;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
