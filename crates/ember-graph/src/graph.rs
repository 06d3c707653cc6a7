//! Three-index module graph.
//!
//! The graph indexes nodes by public URL, by resolved id, and by backing
//! file (one file can back several URL variants through query parameters,
//! e.g. `?direct`). Nodes live in a slot arena with stable indices; removal
//! nulls a slot rather than shifting, so index maps never go stale.
//!
//! All mutation happens under a single `RwLock` write guard and the guard is
//! never held across an await point. Resolution is injected through the
//! [`UrlResolver`] seam so the server's plugin container can participate
//! without a crate cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use path_clean::PathClean;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::node::{ModuleNode, TransformResult};
use crate::url::{clean_url, fs_url_to_path, split_suffix, strip_import_query, strip_timestamp_query};

/// Graph operation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// The URL has no node in the graph.
    #[error("module not found in graph: {0}")]
    ModuleNotFound(String),
}

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Output of plugin resolution for one source specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedId {
    /// Opaque resolved id; may equal the input.
    pub id: String,
    /// Backing file, when the id maps to disk.
    pub file: Option<PathBuf>,
}

/// A URL together with its resolution, as stored on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub resolved_id: String,
    pub file: Option<PathBuf>,
}

/// Resolution seam injected by the embedder.
///
/// Returning `None` means "no opinion": the graph falls back to the URL
/// itself as the id, deriving a file only for `/@fs/` URLs.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Option<ResolvedId>;
}

/// Resolver that never resolves. Useful for tests and for graphs whose URLs
/// are already canonical.
#[derive(Debug, Default)]
pub struct IdentityResolver;

#[async_trait]
impl UrlResolver for IdentityResolver {
    async fn resolve(&self, _url: &str) -> Option<ResolvedId> {
        None
    }
}

#[derive(Default)]
struct GraphInner {
    nodes: Vec<Option<ModuleNode>>,
    free_slots: Vec<usize>,
    url_to_index: FxHashMap<String, usize>,
    id_to_index: FxHashMap<String, usize>,
    file_to_urls: FxHashMap<PathBuf, FxHashSet<String>>,
}

impl GraphInner {
    fn node(&self, url: &str) -> Option<&ModuleNode> {
        let idx = *self.url_to_index.get(url)?;
        self.nodes[idx].as_ref()
    }

    fn node_mut(&mut self, url: &str) -> Option<&mut ModuleNode> {
        let idx = *self.url_to_index.get(url)?;
        self.nodes[idx].as_mut()
    }

    fn insert_slot(&mut self, node: ModuleNode) -> usize {
        match self.free_slots.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Create the node if absent and populate all three indices. Returns the
    /// slot index either way.
    fn ensure(&mut self, url: &str, resolved_id: &str, file: Option<PathBuf>) -> usize {
        if let Some(&idx) = self.url_to_index.get(url) {
            return idx;
        }
        let file = file.map(|f| f.clean());
        let node = ModuleNode::new(url.to_string(), resolved_id.to_string(), file.clone());
        let idx = self.insert_slot(node);
        self.url_to_index.insert(url.to_string(), idx);
        self.id_to_index.entry(resolved_id.to_string()).or_insert(idx);
        if let Some(file) = file {
            self.file_to_urls.entry(file).or_default().insert(url.to_string());
        }
        idx
    }

    /// Fallback creation for URLs discovered as deps before they are ever
    /// requested; resolution happens lazily when the URL is first served.
    fn ensure_plain(&mut self, url: &str) -> usize {
        let file = fs_url_to_path(url);
        self.ensure(url, url, file)
    }
}

/// In-memory directed multigraph of served modules.
pub struct ModuleGraph {
    inner: RwLock<GraphInner>,
    resolver: Arc<dyn UrlResolver>,
}

impl ModuleGraph {
    pub fn new(resolver: Arc<dyn UrlResolver>) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            resolver,
        }
    }

    /// Normalize and resolve a raw URL.
    ///
    /// Strips the `t=` cache buster and the `?import` marker, resolves
    /// through the injected resolver, then appends the resolved extension
    /// when the URL lacked one so `/foo` and `/foo.js` collapse to the same
    /// graph key.
    pub async fn resolve_url(&self, raw: &str) -> ResolvedUrl {
        let url = strip_import_query(&strip_timestamp_query(raw));
        match self.resolver.resolve(&url).await {
            Some(res) => {
                let adjusted = {
                    let (path, suffix) = split_suffix(&url);
                    if Path::new(path).extension().is_none() {
                        Path::new(clean_url(&res.id))
                            .extension()
                            .and_then(|e| e.to_str())
                            .map(|ext| format!("{path}.{ext}{suffix}"))
                    } else {
                        None
                    }
                };
                ResolvedUrl {
                    url: adjusted.unwrap_or(url),
                    resolved_id: res.id,
                    file: res.file,
                }
            }
            None => {
                let file = fs_url_to_path(&url);
                ResolvedUrl {
                    url: url.clone(),
                    resolved_id: url,
                    file,
                }
            }
        }
    }

    /// Look up a node by raw URL, applying full normalization.
    pub async fn get_by_url(&self, raw: &str) -> Option<ModuleNode> {
        let resolved = self.resolve_url(raw).await;
        self.inner.read().node(&resolved.url).cloned()
    }

    /// Direct lookup by already-normalized URL, no resolution.
    pub fn get(&self, url: &str) -> Option<ModuleNode> {
        self.inner.read().node(url).cloned()
    }

    /// Direct lookup by resolved id.
    pub fn get_by_id(&self, id: &str) -> Option<ModuleNode> {
        let inner = self.inner.read();
        let idx = *inner.id_to_index.get(id)?;
        inner.nodes[idx].as_ref().cloned()
    }

    /// Snapshot of every node backed by `file`.
    pub fn get_by_file(&self, file: &Path) -> Vec<ModuleNode> {
        let key = file.to_path_buf().clean();
        let inner = self.inner.read();
        inner
            .file_to_urls
            .get(&key)
            .map(|urls| urls.iter().filter_map(|u| inner.node(u).cloned()).collect())
            .unwrap_or_default()
    }

    /// URLs backed by `file`.
    pub fn urls_by_file(&self, file: &Path) -> FxHashSet<String> {
        let key = file.to_path_buf().clean();
        self.inner
            .read()
            .file_to_urls
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Return the existing node for a resolution or create one, populating
    /// all three indices atomically.
    pub fn ensure_entry(&self, resolved: &ResolvedUrl) -> ModuleNode {
        let mut inner = self.inner.write();
        let idx = inner.ensure(&resolved.url, &resolved.resolved_id, resolved.file.clone());
        inner.nodes[idx].as_ref().cloned().expect("slot populated by ensure")
    }

    /// Resolve a raw URL and ensure its node exists.
    pub async fn ensure_entry_from_url(&self, raw: &str) -> ModuleNode {
        let resolved = self.resolve_url(raw).await;
        self.ensure_entry(&resolved)
    }

    /// Replace a node's import and accept sets after a transform.
    ///
    /// Back-edges are maintained on both sides: every newly imported module
    /// gains this node as an importer, every no-longer-imported module loses
    /// it. Accepted deps are constrained to `imported ∪ {self}`; anything
    /// else is dropped with a debug log.
    ///
    /// Returns the URLs whose importer set became empty, so the caller can
    /// emit a prune signal.
    pub fn update_module_info(
        &self,
        url: &str,
        imported: FxHashSet<String>,
        accepted: FxHashSet<String>,
        is_self_accepting: bool,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        if inner.node(url).is_none() {
            return Err(GraphError::ModuleNotFound(url.to_string()));
        }

        for dep in &imported {
            inner.ensure_plain(dep);
        }

        let accepted: FxHashSet<String> = accepted
            .into_iter()
            .filter(|dep| {
                let keep = dep == url || imported.contains(dep);
                if !keep {
                    debug!(%url, %dep, "dropping accepted dep that is not imported");
                }
                keep
            })
            .collect();

        let prev = {
            let node = inner.node_mut(url).expect("checked above");
            let prev = std::mem::replace(&mut node.imported_modules, imported.clone());
            node.accepted_hmr_deps = accepted;
            node.is_self_accepting = is_self_accepting;
            prev
        };

        for dep in &imported {
            if let Some(dep_node) = inner.node_mut(dep) {
                dep_node.importers.insert(url.to_string());
            }
        }

        let mut no_longer_imported = Vec::new();
        for dep in prev.difference(&imported) {
            if let Some(dep_node) = inner.node_mut(dep) {
                dep_node.importers.remove(url);
                if dep_node.importers.is_empty() {
                    no_longer_imported.push(dep.clone());
                }
            }
        }
        Ok(no_longer_imported)
    }

    /// Store a completed transform on a node, returning the shared handle.
    pub fn set_transform_result(
        &self,
        url: &str,
        result: TransformResult,
    ) -> Result<Arc<TransformResult>> {
        let mut inner = self.inner.write();
        let node = inner
            .node_mut(url)
            .ok_or_else(|| GraphError::ModuleNotFound(url.to_string()))?;
        let shared = Arc::new(result);
        node.transform_result = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// Clear a node's cached transform and stamp its HMR timestamp.
    pub fn invalidate(&self, url: &str, timestamp: u64) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.node_mut(url) {
            node.transform_result = None;
            node.last_hmr_timestamp = timestamp;
        }
    }

    /// Stamp a node's HMR timestamp without touching its cache.
    ///
    /// Used by prune handling so a future re-import bypasses the browser
    /// cache.
    pub fn stamp(&self, url: &str, timestamp: u64) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.node_mut(url) {
            node.last_hmr_timestamp = timestamp;
        }
    }

    /// Drop cached transforms for every node backed by `file`.
    ///
    /// Timestamps are stamped by the HMR invalidation walk, not here; a file
    /// event that produces no hot update leaves timestamps untouched.
    pub fn on_file_change(&self, file: &Path) {
        let key = file.to_path_buf().clean();
        let mut inner = self.inner.write();
        let urls: Vec<String> = inner
            .file_to_urls
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for url in urls {
            if let Some(node) = inner.node_mut(&url) {
                node.transform_result = None;
            }
        }
    }

    /// Clear cached transform results across the whole graph without
    /// dropping nodes.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write();
        for slot in inner.nodes.iter_mut() {
            if let Some(node) = slot {
                node.transform_result = None;
            }
        }
    }

    /// Orphan a node: null its slot and remove it from all three indices.
    pub fn remove_module(&self, url: &str) {
        let mut inner = self.inner.write();
        let Some(idx) = inner.url_to_index.remove(url) else {
            return;
        };
        if let Some(node) = inner.nodes[idx].take() {
            if inner.id_to_index.get(&node.resolved_id) == Some(&idx) {
                inner.id_to_index.remove(&node.resolved_id);
            }
            if let Some(file) = &node.file {
                if let Some(urls) = inner.file_to_urls.get_mut(file) {
                    urls.remove(url);
                    if urls.is_empty() {
                        inner.file_to_urls.remove(file);
                    }
                }
            }
            for importee in &node.imported_modules {
                if let Some(dep) = inner.node_mut(importee) {
                    dep.importers.remove(url);
                }
            }
            for importer in &node.importers {
                if let Some(imp) = inner.node_mut(importer) {
                    imp.imported_modules.remove(url);
                    imp.accepted_hmr_deps.remove(url);
                }
            }
        }
        inner.free_slots.push(idx);
    }

    /// Snapshot of every live URL.
    pub fn urls(&self) -> Vec<String> {
        self.inner.read().url_to_index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().url_to_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
