//! Process-wide server context.
//!
//! The graph, plugin container, client registry, in-flight transform map,
//! pending-reload gate, and glob-importer registry are all process-wide;
//! everything receives them through one `Arc<ServerContext>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use ember_graph::url::clean_url;
use ember_graph::{ModuleGraph, ResolvedId, UrlResolver};

use crate::builtins::FsResolvePlugin;
use crate::config::ServerConfig;
use crate::error::{PendingReloadTimeout, ServerError};
use crate::plugins::{Plugin, PluginContainer};
use crate::transform::PendingTransforms;
use crate::ws::{ClientRegistry, HmrPayload};

/// One registered glob import: `import.meta.glob("<pattern>")` recorded for
/// an importing module.
pub struct GlobImport {
    pub base: PathBuf,
    pub pattern: String,
    matcher: GlobMatcher,
}

/// Adapts the plugin container to the graph's resolution seam.
struct ContainerResolver {
    container: Arc<PluginContainer>,
}

#[async_trait]
impl UrlResolver for ContainerResolver {
    async fn resolve(&self, url: &str) -> Option<ResolvedId> {
        match self.container.resolve_id(url, None).await {
            Ok(resolved) if !resolved.external => {
                let path = Path::new(clean_url(&resolved.id));
                let file = path.is_absolute().then(|| path.to_path_buf());
                Some(ResolvedId {
                    id: resolved.id,
                    file,
                })
            }
            Ok(_) => None,
            Err(err) => {
                debug!(url, %err, "resolution failed during graph lookup");
                None
            }
        }
    }
}

/// Shared state of one running dev server.
pub struct ServerContext {
    pub config: ServerConfig,
    pub graph: Arc<ModuleGraph>,
    pub container: Arc<PluginContainer>,
    pub clients: ClientRegistry,
    pub(crate) pending: PendingTransforms,
    pending_reload: RwLock<Option<watch::Receiver<bool>>>,
    glob_importers: RwLock<FxHashMap<String, Vec<GlobImport>>>,
    watch_tx: RwLock<Option<mpsc::UnboundedSender<PathBuf>>>,
    start: Instant,
}

impl ServerContext {
    /// Build the context: user plugins plus the built-in fs resolver, the
    /// container, and a graph resolving through it.
    pub fn new(config: ServerConfig, user_plugins: Vec<Arc<dyn Plugin>>) -> Arc<Self> {
        let mut plugins = user_plugins;
        plugins.push(Arc::new(FsResolvePlugin::new(
            config.root.clone(),
            config.resolve_extensions.clone(),
        )));
        let container = Arc::new(PluginContainer::new(
            plugins,
            vec![config.root.clone(), config.cache_dir.clone()],
        ));
        let graph = Arc::new(ModuleGraph::new(Arc::new(ContainerResolver {
            container: Arc::clone(&container),
        })));
        Arc::new(Self {
            config,
            graph,
            container,
            clients: ClientRegistry::new(),
            pending: PendingTransforms::default(),
            pending_reload: RwLock::new(None),
            glob_importers: RwLock::new(FxHashMap::default()),
            watch_tx: RwLock::new(None),
            start: Instant::now(),
        })
    }

    /// Monotonic milliseconds since server start. Never 0: that value is
    /// reserved for "never invalidated".
    pub fn now_ts(&self) -> u64 {
        (self.start.elapsed().as_millis() as u64).max(1)
    }

    pub async fn broadcast(&self, payload: &HmrPayload) {
        self.clients.broadcast(payload).await;
    }

    /// Install the channel through which the pipeline asks the watcher to
    /// cover newly served files.
    pub fn set_watch_channel(&self, tx: mpsc::UnboundedSender<PathBuf>) {
        *self.watch_tx.write() = Some(tx);
    }

    /// Ask the watcher to cover `file`.
    pub fn watch_file(&self, file: &Path) {
        match &*self.watch_tx.read() {
            Some(tx) => {
                let _ = tx.send(file.to_path_buf());
            }
            None => debug!(file = %file.display(), "no watch channel installed"),
        }
    }

    /// Publish a pending-reload gate. Transform requests (other than the
    /// client runtime) wait on it until the optimizer signals completion.
    ///
    /// Returns the sender; send `true` and call
    /// [`ServerContext::finish_pending_reload`] once re-bundling is done.
    pub fn begin_pending_reload(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.pending_reload.write() = Some(rx);
        tx
    }

    pub fn finish_pending_reload(&self) {
        *self.pending_reload.write() = None;
    }

    /// Wait for any pending pre-bundle reload, up to `timeout`.
    pub async fn wait_pending_reload(
        &self,
        timeout: Duration,
    ) -> Result<(), PendingReloadTimeout> {
        let rx = self.pending_reload.read().clone();
        let Some(mut rx) = rx else {
            return Ok(());
        };
        if *rx.borrow() {
            return Ok(());
        }
        let result = match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(Ok(_)) => Ok(()),
            // sender dropped: the re-bundle task died; let requests through
            // rather than wedging the server
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(PendingReloadTimeout),
        };
        result
    }

    /// Record that `importer_url` glob-imports `pattern` relative to `base`.
    pub fn register_glob_importer(
        &self,
        importer_url: &str,
        base: PathBuf,
        pattern: &str,
    ) -> Result<(), ServerError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| ServerError::InvalidGlob {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();
        self.glob_importers
            .write()
            .entry(importer_url.to_string())
            .or_default()
            .push(GlobImport {
                base,
                pattern: pattern.to_string(),
                matcher,
            });
        Ok(())
    }

    /// Importer URLs whose glob patterns match an added/removed file.
    pub fn glob_importers_matching(&self, file: &Path) -> Vec<String> {
        let registry = self.glob_importers.read();
        let mut matched = Vec::new();
        for (url, imports) in registry.iter() {
            let hit = imports.iter().any(|gi| {
                gi.matcher.is_match(file)
                    || file
                        .strip_prefix(&gi.base)
                        .map(|rel| gi.matcher.is_match(rel))
                        .unwrap_or(false)
            });
            if hit {
                matched.push(url.clone());
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<ServerContext> {
        ServerContext::new(ServerConfig::new("/srv/app"), vec![])
    }

    #[tokio::test]
    async fn test_pending_reload_pass_through_when_absent() {
        let ctx = ctx();
        assert!(ctx
            .wait_pending_reload(Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_pending_reload_times_out() {
        let ctx = ctx();
        let _tx = ctx.begin_pending_reload();
        assert!(ctx
            .wait_pending_reload(Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pending_reload_released_by_signal() {
        let ctx = ctx();
        let tx = ctx.begin_pending_reload();
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_pending_reload(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_ok());
        ctx.finish_pending_reload();
        assert!(ctx
            .wait_pending_reload(Duration::from_millis(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_glob_importers_match_absolute_and_relative() {
        let ctx = ctx();
        ctx.register_glob_importer(
            "/src/pages.js",
            PathBuf::from("/srv/app/src/pages"),
            "*.js",
        )
        .unwrap();

        let matched = ctx.glob_importers_matching(Path::new("/srv/app/src/pages/about.js"));
        assert_eq!(matched, vec!["/src/pages.js".to_string()]);

        assert!(ctx
            .glob_importers_matching(Path::new("/srv/app/src/other/readme.md"))
            .is_empty());
    }

    #[test]
    fn test_invalid_glob_is_an_error() {
        let ctx = ctx();
        let err = ctx
            .register_glob_importer("/a.js", PathBuf::from("/srv"), "ab[")
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidGlob { .. }));
    }

    #[test]
    fn test_now_ts_never_zero() {
        let ctx = ctx();
        assert!(ctx.now_ts() >= 1);
    }
}
