//! # ember-optimizer
//!
//! Dependency scanner and pre-bundle optimizer for the ember dev server.
//!
//! The scanner crawls from entry HTML/JS files to enumerate bare-module
//! imports; the optimizer bundles those deps into the cache directory in a
//! single amortized pass, keyed by a content hash, and tracks per-dep
//! interop needs in `_metadata.json`. Dependencies discovered at runtime
//! re-enter through [`DepOptimizer::register_missing_import`], which holds
//! incoming transforms behind the server's pending-reload gate while the
//! bundle is refreshed.
//!
//! The external bundler is consumed only through the [`ScanBackend`] and
//! [`BundleBackend`] traits; conservative built-in drivers
//! ([`WorkQueueScanner`], [`PassthroughBackend`]) make the system usable
//! stand-alone.

pub mod error;
pub mod metadata;
pub mod optimize;
pub mod scan;

pub use error::{OptimizeError, Result};
pub use metadata::{DepMetadata, OptimizedDep, METADATA_FILE};
pub use optimize::{
    compute_main_hash, flatten_id, optimize_deps, BundleBackend, BundleOutput, BundleRequest,
    BundledEntry, DepOptimizer, PassthroughBackend,
};
pub use scan::{
    discover_entries, scan_imports, ScanBackend, ScanPlugin, ScanResolution, ScanResult,
    WorkQueueScanner,
};
