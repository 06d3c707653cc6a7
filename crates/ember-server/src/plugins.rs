//! Plugin hooks and the container that drives them.
//!
//! A plugin is a record of optionally-implemented hooks; every hook has a
//! no-op default so implementations override only what they need. The
//! container sorts plugins into `pre` / default / `post` buckets at
//! construction and drives them through the resolve → load → transform
//! contract:
//!
//! - `resolve_id`: first non-`None` wins, `External` short-circuits; if every
//!   plugin passes, the source specifier itself is the id.
//! - `load`: first non-`None` wins; if none match and the id names a file
//!   inside an allowed root, the container reads it as UTF-8.
//! - `transform`: chained; each plugin's output feeds the next.
//! - `handle_hot_update`: chained list replacement; each plugin sees the
//!   previous plugin's (possibly filtered) module list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransformError;
use crate::hmr::read_modified_file;
use crate::sourcemap::combine_sourcemaps;

/// Ordering bucket for a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PluginEnforce {
    Pre,
    #[default]
    Normal,
    Post,
}

/// Output of a `resolve_id` hook.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveIdResult {
    /// Resolved to an id, with optional plugin-private metadata.
    Id {
        id: String,
        meta: Option<serde_json::Value>,
    },
    /// The specifier is external; stop resolving and do not traverse.
    External,
}

impl ResolveIdResult {
    pub fn id(id: impl Into<String>) -> Self {
        ResolveIdResult::Id {
            id: id.into(),
            meta: None,
        }
    }
}

/// Output of a `load` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub code: String,
    pub map: Option<String>,
}

impl LoadResult {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

/// Output of a `transform` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformHookOutput {
    pub code: String,
    pub map: Option<String>,
}

/// Container-level resolution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResolvedId {
    pub id: String,
    pub external: bool,
}

/// Context handed to `handle_hot_update`.
pub struct HotUpdateContext<'a> {
    pub file: &'a Path,
    pub timestamp: u64,
    /// Modules mapped to the changed file, as filtered so far.
    pub modules: &'a [String],
}

impl HotUpdateContext<'_> {
    /// Read the changed file, retrying while editors that signal before
    /// flushing leave it momentarily empty.
    pub async fn read(&self) -> std::io::Result<String> {
        read_modified_file(self.file).await
    }
}

/// One participant in the resolve / load / transform pipeline.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Normal
    }

    /// Called once after the configuration is final.
    async fn config_resolved(&self, _config: &crate::config::ServerConfig) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the server starts handling requests.
    async fn build_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resolve_id(
        &self,
        _source: &str,
        _importer: Option<&str>,
    ) -> anyhow::Result<Option<ResolveIdResult>> {
        Ok(None)
    }

    async fn load(&self, _id: &str) -> anyhow::Result<Option<LoadResult>> {
        Ok(None)
    }

    async fn transform(
        &self,
        _code: &str,
        _id: &str,
    ) -> anyhow::Result<Option<TransformHookOutput>> {
        Ok(None)
    }

    /// Narrow or widen the set of modules affected by a file change.
    async fn handle_hot_update(
        &self,
        _ctx: &HotUpdateContext<'_>,
    ) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }
}

/// Drives an ordered sequence of plugins through the hook contract.
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
    /// Roots the container's disk-read fallback may serve from.
    allowed_roots: Vec<PathBuf>,
}

impl PluginContainer {
    /// Build a container; plugins keep insertion order within their enforce
    /// bucket, `pre` before unmarked before `post`.
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>, allowed_roots: Vec<PathBuf>) -> Self {
        plugins.sort_by_key(|p| p.enforce());
        Self {
            plugins,
            allowed_roots,
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    fn hook_err(
        plugin: &dyn Plugin,
        hook: &'static str,
        id: &str,
        err: anyhow::Error,
    ) -> TransformError {
        TransformError::Plugin {
            plugin: plugin.name().to_string(),
            hook,
            id: id.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub async fn config_resolved(
        &self,
        config: &crate::config::ServerConfig,
    ) -> Result<(), TransformError> {
        for plugin in &self.plugins {
            plugin
                .config_resolved(config)
                .await
                .map_err(|e| Self::hook_err(plugin.as_ref(), "configResolved", "", e))?;
        }
        Ok(())
    }

    pub async fn build_start(&self) -> Result<(), TransformError> {
        for plugin in &self.plugins {
            plugin
                .build_start()
                .await
                .map_err(|e| Self::hook_err(plugin.as_ref(), "buildStart", "", e))?;
        }
        Ok(())
    }

    /// Resolve a specifier; falls back to the specifier itself when no
    /// plugin claims it.
    pub async fn resolve_id(
        &self,
        source: &str,
        importer: Option<&str>,
    ) -> Result<PartialResolvedId, TransformError> {
        for plugin in &self.plugins {
            match plugin
                .resolve_id(source, importer)
                .await
                .map_err(|e| Self::hook_err(plugin.as_ref(), "resolveId", source, e))?
            {
                Some(ResolveIdResult::External) => {
                    return Ok(PartialResolvedId {
                        id: source.to_string(),
                        external: true,
                    })
                }
                Some(ResolveIdResult::Id { id, .. }) => {
                    debug!(plugin = plugin.name(), source, %id, "resolved");
                    return Ok(PartialResolvedId {
                        id,
                        external: false,
                    });
                }
                None => {}
            }
        }
        Ok(PartialResolvedId {
            id: source.to_string(),
            external: false,
        })
    }

    /// Load an id; first plugin wins, then the disk fallback for files under
    /// an allowed root.
    ///
    /// A missing file yields `None` (the caller decides 404); a present but
    /// unreadable file is an error.
    pub async fn load(&self, id: &str) -> Result<Option<LoadResult>, TransformError> {
        for plugin in &self.plugins {
            if let Some(result) = plugin
                .load(id)
                .await
                .map_err(|e| Self::hook_err(plugin.as_ref(), "load", id, e))?
            {
                return Ok(Some(result));
            }
        }

        let path = PathBuf::from(ember_graph::url::clean_url(id));
        if !self.allowed_roots.iter().any(|root| path.starts_with(root)) {
            return Ok(None);
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(code) => Ok(Some(LoadResult { code, map: None })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransformError::Load {
                id: id.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Run the transform chain over `code`.
    pub async fn transform(
        &self,
        code: String,
        id: &str,
    ) -> Result<TransformHookOutput, TransformError> {
        let mut code = code;
        let mut maps = Vec::new();
        for plugin in &self.plugins {
            if let Some(out) = plugin
                .transform(&code, id)
                .await
                .map_err(|e| Self::hook_err(plugin.as_ref(), "transform", id, e))?
            {
                code = out.code;
                if let Some(map) = out.map {
                    maps.push(map);
                }
            }
        }
        Ok(TransformHookOutput {
            code,
            map: combine_sourcemaps(maps),
        })
    }

    /// Run the hot-update hooks; each plugin's returned list replaces the
    /// context's module list for the next plugin.
    pub async fn handle_hot_update(
        &self,
        file: &Path,
        timestamp: u64,
        mut modules: Vec<String>,
    ) -> Result<Vec<String>, TransformError> {
        for plugin in &self.plugins {
            let ctx = HotUpdateContext {
                file,
                timestamp,
                modules: &modules,
            };
            if let Some(filtered) = plugin.handle_hot_update(&ctx).await.map_err(|e| {
                Self::hook_err(plugin.as_ref(), "handleHotUpdate", &file.display().to_string(), e)
            })? {
                debug!(
                    plugin = plugin.name(),
                    before = modules.len(),
                    after = filtered.len(),
                    "hot-update modules filtered"
                );
                modules = filtered;
            }
        }
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin {
        name: &'static str,
        enforce: PluginEnforce,
    }

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            self.name
        }
        fn enforce(&self) -> PluginEnforce {
            self.enforce
        }
    }

    struct PrefixTransform(&'static str);

    #[async_trait]
    impl Plugin for PrefixTransform {
        fn name(&self) -> &str {
            "prefix"
        }
        async fn transform(
            &self,
            code: &str,
            _id: &str,
        ) -> anyhow::Result<Option<TransformHookOutput>> {
            Ok(Some(TransformHookOutput {
                code: format!("{}{}", self.0, code),
                map: None,
            }))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl Plugin for FailingResolver {
        fn name(&self) -> &str {
            "failing"
        }
        async fn resolve_id(
            &self,
            _source: &str,
            _importer: Option<&str>,
        ) -> anyhow::Result<Option<ResolveIdResult>> {
            anyhow::bail!("boom")
        }
    }

    fn container(plugins: Vec<Arc<dyn Plugin>>) -> PluginContainer {
        PluginContainer::new(plugins, vec![])
    }

    #[test]
    fn test_enforce_ordering() {
        let c = container(vec![
            Arc::new(NamedPlugin {
                name: "post",
                enforce: PluginEnforce::Post,
            }),
            Arc::new(NamedPlugin {
                name: "normal-a",
                enforce: PluginEnforce::Normal,
            }),
            Arc::new(NamedPlugin {
                name: "pre",
                enforce: PluginEnforce::Pre,
            }),
            Arc::new(NamedPlugin {
                name: "normal-b",
                enforce: PluginEnforce::Normal,
            }),
        ]);
        assert_eq!(c.plugin_names(), vec!["pre", "normal-a", "normal-b", "post"]);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_source() {
        let c = container(vec![]);
        let resolved = c.resolve_id("/app.js", None).await.unwrap();
        assert_eq!(resolved.id, "/app.js");
        assert!(!resolved.external);
    }

    #[tokio::test]
    async fn test_resolve_error_propagates_as_transform_failure() {
        let c = container(vec![Arc::new(FailingResolver)]);
        let err = c.resolve_id("/app.js", None).await.unwrap_err();
        assert!(matches!(err, TransformError::Plugin { hook: "resolveId", .. }));
    }

    #[tokio::test]
    async fn test_transform_chains_in_order() {
        let c = container(vec![
            Arc::new(PrefixTransform("a;")),
            Arc::new(PrefixTransform("b;")),
        ]);
        let out = c.transform("code".into(), "/x.js").await.unwrap();
        assert_eq!(out.code, "b;a;code");
    }

    #[tokio::test]
    async fn test_load_disk_fallback_respects_roots() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.js");
        std::fs::write(&file, "export default 1").unwrap();

        let inside = PluginContainer::new(vec![], vec![dir.path().to_path_buf()]);
        let loaded = inside.load(&file.display().to_string()).await.unwrap();
        assert_eq!(loaded.unwrap().code, "export default 1");

        let outside = PluginContainer::new(vec![], vec![PathBuf::from("/somewhere/else")]);
        assert!(outside
            .load(&file.display().to_string())
            .await
            .unwrap()
            .is_none());
    }

    struct WideningHotUpdate;

    #[async_trait]
    impl Plugin for WideningHotUpdate {
        fn name(&self) -> &str {
            "widen"
        }
        async fn handle_hot_update(
            &self,
            ctx: &HotUpdateContext<'_>,
        ) -> anyhow::Result<Option<Vec<String>>> {
            let mut modules = ctx.modules.to_vec();
            modules.push("/extra.js".to_string());
            Ok(Some(modules))
        }
    }

    struct NarrowingHotUpdate;

    #[async_trait]
    impl Plugin for NarrowingHotUpdate {
        fn name(&self) -> &str {
            "narrow"
        }
        async fn handle_hot_update(
            &self,
            ctx: &HotUpdateContext<'_>,
        ) -> anyhow::Result<Option<Vec<String>>> {
            // later plugins see the widened list
            assert!(ctx.modules.contains(&"/extra.js".to_string()));
            Ok(Some(vec![ctx.modules[0].clone()]))
        }
    }

    #[tokio::test]
    async fn test_hot_update_list_replacement_chains() {
        let c = container(vec![Arc::new(WideningHotUpdate), Arc::new(NarrowingHotUpdate)]);
        let out = c
            .handle_hot_update(Path::new("/root/a.js"), 1, vec!["/a.js".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec!["/a.js".to_string()]);
    }
}
