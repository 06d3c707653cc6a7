//! Module node types.
//!
//! A node represents one served URL. Edge sets hold peer URLs rather than
//! references so nodes stay cheaply cloneable; the graph's indices resolve
//! URLs back to slots.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::url::is_css_url;

/// The kind of a served module, fixed at creation from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Js,
    Css,
}

impl ModuleKind {
    pub fn from_url(url: &str) -> Self {
        if is_css_url(url) {
            ModuleKind::Css
        } else {
            ModuleKind::Js
        }
    }

    pub fn is_css(self) -> bool {
        matches!(self, ModuleKind::Css)
    }
}

/// Cached output of a completed transform.
///
/// The etag is always the weak etag of `code`; constructing through
/// [`TransformResult::new`] maintains that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    pub etag: String,
}

impl TransformResult {
    pub fn new(code: String, map: Option<String>) -> Self {
        let etag = weak_etag(&code);
        Self { code, map, etag }
    }
}

/// Compute the weak etag for a body of code.
///
/// Shape: `W/"<byte-length>-<blake3 prefix>"`. Deterministic for identical
/// content, cheap to compare against `If-None-Match`.
pub fn weak_etag(code: &str) -> String {
    let hash = blake3::hash(code.as_bytes());
    format!("W/\"{:x}-{}\"", code.len(), &hash.to_hex().as_str()[..16])
}

/// One entity in the module graph.
///
/// Heavy cached data (`transform_result`) is Arc-wrapped so snapshots handed
/// out by the graph are cheap to clone.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Public path beginning with `/` (or the `/@fs/` prefix).
    pub url: String,
    /// Opaque id produced by plugin resolution; may equal `url`.
    pub resolved_id: String,
    /// Backing filesystem path with query/hash stripped, absent for virtual
    /// modules.
    pub file: Option<PathBuf>,
    pub kind: ModuleKind,
    /// URLs of nodes that import this node.
    pub importers: FxHashSet<String>,
    /// URLs of nodes this node currently imports.
    pub imported_modules: FxHashSet<String>,
    /// Subset of `imported_modules` (plus possibly `url` itself) declared via
    /// hot-accept.
    pub accepted_hmr_deps: FxHashSet<String>,
    pub is_self_accepting: bool,
    pub transform_result: Option<Arc<TransformResult>>,
    /// Monotonic milliseconds; 0 until first invalidation.
    pub last_hmr_timestamp: u64,
}

impl ModuleNode {
    pub fn new(url: String, resolved_id: String, file: Option<PathBuf>) -> Self {
        let kind = ModuleKind::from_url(&url);
        Self {
            url,
            resolved_id,
            file,
            kind,
            importers: FxHashSet::default(),
            imported_modules: FxHashSet::default(),
            accepted_hmr_deps: FxHashSet::default(),
            is_self_accepting: false,
            transform_result: None,
            last_hmr_timestamp: 0,
        }
    }
}
