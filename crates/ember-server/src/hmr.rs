//! Hot-update propagation.
//!
//! A changed file flows through pre-filter gates (config/env restart, client
//! runtime reload, no-module HTML reload), then each mapped module gets an
//! invalidation walk and a boundary walk over the importer graph. Any walk
//! that dead-ends degrades the whole batch to a single full reload;
//! otherwise one `update` payload carries every collected boundary.

use std::path::Path;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use ember_graph::{ModuleGraph, ModuleNode};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::watcher::FileChange;
use crate::ws::{HmrPayload, Update, UpdateKind};

/// What a file event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmrOutcome {
    /// Nothing mapped to the change.
    Ignored,
    /// Config or env file changed; the embedder should restart the server.
    ServerRestart,
    /// A full page reload was broadcast.
    FullReload,
    /// An update payload with this many entries was broadcast.
    Updates(usize),
}

/// Entry point for one watcher event.
pub async fn handle_file_change(
    ctx: &ServerContext,
    change: &FileChange,
) -> Result<HmrOutcome, ServerError> {
    match change {
        FileChange::Modified(path) => handle_hmr_update(ctx, path).await,
        FileChange::Created(path) | FileChange::Removed(path) => {
            handle_file_add_unlink(ctx, path).await
        }
    }
}

/// Handle a modification event.
pub async fn handle_hmr_update(ctx: &ServerContext, file: &Path) -> Result<HmrOutcome, ServerError> {
    let short = short_name(ctx, file);

    if is_config_dependency(ctx, file) || is_env_file(ctx, file) {
        info!("{short} changed, restarting server");
        return Ok(HmrOutcome::ServerRestart);
    }

    debug!(file = %file.display(), "file changed");
    ctx.graph.on_file_change(file);
    let timestamp = ctx.now_ts();

    if let Some(client_dir) = &ctx.config.client_dir {
        if file.starts_with(client_dir) {
            info!("client runtime changed, full reload");
            ctx.broadcast(&HmrPayload::FullReload {
                path: Some("*".to_string()),
            })
            .await;
            return Ok(HmrOutcome::FullReload);
        }
    }

    let modules: Vec<String> = ctx.graph.urls_by_file(file).into_iter().collect();
    let filtered = ctx
        .container
        .handle_hot_update(file, timestamp, modules)
        .await?;

    if filtered.is_empty() {
        if is_html_file(file) {
            info!("{short} changed, page reload");
            ctx.broadcast(&HmrPayload::FullReload {
                path: ctx.config.url_path_for(file),
            })
            .await;
            return Ok(HmrOutcome::FullReload);
        }
        debug!("{short} maps to no modules");
        return Ok(HmrOutcome::Ignored);
    }

    update_modules(ctx, &short, filtered, timestamp).await
}

/// Handle a file addition or removal: graph modules plus glob importers.
pub async fn handle_file_add_unlink(
    ctx: &ServerContext,
    file: &Path,
) -> Result<HmrOutcome, ServerError> {
    let mut urls: Vec<String> = ctx.graph.urls_by_file(file).into_iter().collect();
    for importer_url in ctx.glob_importers_matching(file) {
        if let Some(node) = ctx.graph.get(&importer_url) {
            if let Some(f) = &node.file {
                ctx.graph.on_file_change(f);
            }
            urls.push(importer_url);
        }
    }
    if urls.is_empty() {
        return Ok(HmrOutcome::Ignored);
    }
    ctx.graph.on_file_change(file);
    urls.sort();
    urls.dedup();
    update_modules(ctx, &short_name(ctx, file), urls, ctx.now_ts()).await
}

/// Invalidate and propagate for every module in the (possibly plugin
/// filtered) set, then broadcast the aggregate payload.
pub async fn update_modules(
    ctx: &ServerContext,
    label: &str,
    urls: Vec<String>,
    timestamp: u64,
) -> Result<HmrOutcome, ServerError> {
    let graph = &ctx.graph;
    let mut updates: Vec<Update> = Vec::new();
    let mut emitted: FxHashSet<(String, String)> = FxHashSet::default();
    let mut need_full_reload = false;

    for url in urls {
        let Some(node) = graph.get(&url) else {
            continue;
        };
        let mut seen = FxHashSet::default();
        invalidate_walk(graph, &node.url, timestamp, &mut seen);

        if need_full_reload {
            continue;
        }

        let mut boundaries = Vec::new();
        let mut chain = vec![node.url.clone()];
        if propagate_update(graph, &node, &mut boundaries, &mut chain) {
            debug!(url = %node.url, "propagation dead end");
            need_full_reload = true;
            continue;
        }

        for (boundary, accepted_via) in boundaries {
            if !emitted.insert((boundary.url.clone(), accepted_via.clone())) {
                continue;
            }
            // the boundary re-runs; its cached transform is stale now
            graph.invalidate(&boundary.url, timestamp);
            updates.push(Update {
                kind: if boundary.kind.is_css() {
                    UpdateKind::CssUpdate
                } else {
                    UpdateKind::JsUpdate
                },
                timestamp,
                path: boundary.url,
                accepted_path: accepted_via,
            });
        }
    }

    if need_full_reload {
        info!("{label} changed, full reload");
        ctx.broadcast(&HmrPayload::FullReload { path: None }).await;
        return Ok(HmrOutcome::FullReload);
    }
    if updates.is_empty() {
        return Ok(HmrOutcome::Ignored);
    }
    let count = updates.len();
    info!("{label} hot updated ({count} boundaries)");
    ctx.broadcast(&HmrPayload::Update { updates }).await;
    Ok(HmrOutcome::Updates(count))
}

/// Emit a prune payload for modules that are no longer imported, stamping
/// their timestamps so future re-imports bypass the browser cache.
pub async fn handle_prune(ctx: &ServerContext, urls: Vec<String>) {
    let timestamp = ctx.now_ts();
    for url in &urls {
        ctx.graph.stamp(url, timestamp);
    }
    debug!(count = urls.len(), "pruning modules");
    ctx.broadcast(&HmrPayload::Prune { paths: urls }).await;
}

/// Clear caches upward from a changed module.
///
/// Recursion continues through importers that do not accept the current
/// module. A self-accepting module contains its own change: importers keep
/// their caches (they will be told nothing, or re-run their accept
/// callbacks against the refetched dep).
fn invalidate_walk(graph: &ModuleGraph, url: &str, timestamp: u64, seen: &mut FxHashSet<String>) {
    if !seen.insert(url.to_string()) {
        return;
    }
    graph.invalidate(url, timestamp);
    let Some(node) = graph.get(url) else {
        return;
    };
    if node.is_self_accepting {
        return;
    }
    for importer in &node.importers {
        if let Some(imp) = graph.get(importer) {
            if !imp.accepted_hmr_deps.contains(url) {
                invalidate_walk(graph, importer, timestamp, seen);
            }
        }
    }
}

/// Walk importers collecting `{boundary, accepted_via}` pairs.
///
/// Returns true when the walk hits a dead end (no boundary on some path, a
/// JS module bubbling into an all-CSS importer set, or a cycle).
fn propagate_update(
    graph: &ModuleGraph,
    node: &ModuleNode,
    boundaries: &mut Vec<(ModuleNode, String)>,
    chain: &mut Vec<String>,
) -> bool {
    if node.is_self_accepting {
        boundaries.push((node.clone(), node.url.clone()));

        // a CSS importer may pull this file in through a
        // preprocessor-registered dependency; propagate through it rather
        // than treating it as a dead end
        for importer_url in &node.importers {
            let Some(importer) = graph.get(importer_url) else {
                continue;
            };
            if importer.kind.is_css() && !chain.contains(importer_url) {
                chain.push(importer_url.clone());
                propagate_update(graph, &importer, boundaries, chain);
                chain.pop();
            }
        }
        return false;
    }

    if node.importers.is_empty() {
        return true;
    }

    // a JS file cannot bubble through CSS parents
    if !node.kind.is_css()
        && node.importers.iter().all(|url| {
            graph
                .get(url)
                .map(|importer| importer.kind.is_css())
                .unwrap_or(false)
        })
    {
        return true;
    }

    for importer_url in &node.importers {
        let Some(importer) = graph.get(importer_url) else {
            continue;
        };
        if importer.accepted_hmr_deps.contains(&node.url) {
            boundaries.push((importer, node.url.clone()));
            continue;
        }
        if chain.contains(importer_url) {
            // cycle
            return true;
        }
        chain.push(importer_url.clone());
        let dead_end = propagate_update(graph, &importer, boundaries, chain);
        chain.pop();
        if dead_end {
            return true;
        }
    }
    false
}

/// Read a changed file, working around editors that signal the change
/// before flushing: when the first read comes back empty, poll mtime up to
/// ten 10 ms intervals before re-reading.
pub async fn read_modified_file(file: &Path) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(file).await?;
    if !content.is_empty() {
        return Ok(content);
    }
    let mtime = tokio::fs::metadata(file).await?.modified()?;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let current = tokio::fs::metadata(file).await?.modified()?;
        if current != mtime {
            break;
        }
    }
    tokio::fs::read_to_string(file).await
}

fn is_config_dependency(ctx: &ServerContext, file: &Path) -> bool {
    ctx.config.config_file.as_deref() == Some(file)
        || ctx.config.config_deps.iter().any(|dep| dep == file)
}

fn is_env_file(ctx: &ServerContext, file: &Path) -> bool {
    ctx.config.handle_env_files
        && file
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".env"))
}

fn is_html_file(file: &Path) -> bool {
    matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("html") | Some("htm")
    )
}

fn short_name(ctx: &ServerContext, file: &Path) -> String {
    file.strip_prefix(&ctx.config.root)
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|_| file.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::path::PathBuf;

    #[test]
    fn test_env_and_config_gates() {
        let mut config = ServerConfig::new("/srv/app");
        config.config_file = Some(PathBuf::from("/srv/app/ember.config.json"));
        config.config_deps = vec![PathBuf::from("/srv/app/config/extra.json")];
        let ctx = crate::context::ServerContext::new(config, vec![]);

        assert!(is_config_dependency(&ctx, Path::new("/srv/app/ember.config.json")));
        assert!(is_config_dependency(&ctx, Path::new("/srv/app/config/extra.json")));
        assert!(!is_config_dependency(&ctx, Path::new("/srv/app/src/main.js")));

        assert!(is_env_file(&ctx, Path::new("/srv/app/.env")));
        assert!(is_env_file(&ctx, Path::new("/srv/app/.env.local")));
        assert!(!is_env_file(&ctx, Path::new("/srv/app/env.js")));
    }

    #[test]
    fn test_env_gate_disabled() {
        let mut config = ServerConfig::new("/srv/app");
        config.handle_env_files = false;
        let ctx = crate::context::ServerContext::new(config, vec![]);
        assert!(!is_env_file(&ctx, Path::new("/srv/app/.env")));
    }

    #[test]
    fn test_html_detection() {
        assert!(is_html_file(Path::new("/srv/index.html")));
        assert!(is_html_file(Path::new("/srv/page.htm")));
        assert!(!is_html_file(Path::new("/srv/app.js")));
    }

    #[tokio::test]
    async fn test_read_modified_file_retries_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changed.js");
        std::fs::write(&file, "").unwrap();

        let reader = tokio::spawn({
            let file = file.clone();
            async move { read_modified_file(&file).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&file, "flushed content").unwrap();

        let content = reader.await.unwrap().unwrap();
        assert_eq!(content, "flushed content");
    }
}
