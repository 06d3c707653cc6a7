//! On-demand transform pipeline.
//!
//! `transform_request` produces a cached `{code, map, etag}` for a URL by
//! driving the plugin container through resolve → load → transform, keeping
//! the module graph's import and hot-accept bookkeeping current along the
//! way.
//!
//! Requests deduplicate per cache key: the in-flight map holds a watch
//! channel per key, concurrent callers attach to the leader's channel, and
//! the entry is removed when the computation completes, success or failure.
//! That map is the only shared state touched across suspension points.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use path_clean::PathClean;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

use ember_graph::url::{clean_url, split_suffix, strip_timestamp_query};
use ember_graph::{ModuleKind, ModuleNode, TransformResult};

use crate::accept_lexer::lex_accepted_deps;
use crate::context::ServerContext;
use crate::error::TransformError;
use crate::lexer::parse_module_records;
use crate::sourcemap::fill_sources_content;

/// Request flavor; affects the dedup key and node-cache participation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub ssr: bool,
    pub html: bool,
}

pub type TransformOutcome = Result<Option<Arc<TransformResult>>, TransformError>;

/// In-flight request map; the locking discipline of the pipeline.
#[derive(Default)]
pub(crate) struct PendingTransforms {
    map: Mutex<FxHashMap<String, watch::Receiver<Option<TransformOutcome>>>>,
}

fn cache_key(url: &str, opts: TransformOptions) -> String {
    if opts.ssr {
        format!("ssr:{url}")
    } else if opts.html {
        format!("html:{url}")
    } else {
        url.to_string()
    }
}

enum Role {
    Leader(watch::Sender<Option<TransformOutcome>>),
    Follower(watch::Receiver<Option<TransformOutcome>>),
}

/// Transform one URL, deduplicating concurrent callers onto the same
/// computation.
pub async fn transform_request(
    ctx: &ServerContext,
    url: &str,
    opts: TransformOptions,
) -> TransformOutcome {
    let key = cache_key(url, opts);
    let role = {
        let mut map = ctx.pending.map.lock();
        match map.get(&key) {
            Some(rx) => Role::Follower(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                map.insert(key.clone(), rx);
                Role::Leader(tx)
            }
        }
    };

    match role {
        Role::Follower(mut rx) => {
            debug!(url, "attaching to in-flight transform");
            match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => outcome.clone().expect("guarded by wait_for"),
                Err(_) => Err(TransformError::Interrupted {
                    url: url.to_string(),
                }),
            }
        }
        Role::Leader(tx) => {
            let outcome = do_transform(ctx, url, opts).await;
            // entry removal is unconditional on completion
            ctx.pending.map.lock().remove(&key);
            let _ = tx.send(Some(outcome.clone()));
            outcome
        }
    }
}

async fn do_transform(ctx: &ServerContext, raw_url: &str, opts: TransformOptions) -> TransformOutcome {
    let started = Instant::now();
    let url = strip_timestamp_query(raw_url);

    if !opts.ssr && !opts.html {
        if let Some(module) = ctx.graph.get_by_url(&url).await {
            if let Some(result) = module.transform_result {
                debug!(%url, "transform cache hit");
                return Ok(Some(result));
            }
        }
    }

    let resolved = ctx.container.resolve_id(&url, None).await?;
    if resolved.external {
        debug!(%url, "external module, nothing to transform");
        return Ok(None);
    }
    let id = resolved.id;

    let (code, load_map) = match ctx.container.load(&id).await? {
        Some(loaded) => (loaded.code, loaded.map),
        None => {
            if is_public_request(ctx, &url) {
                let suggestion = clean_url(&url).to_string();
                return Err(TransformError::PublicPathMisuse {
                    url: url.clone(),
                    suggestion,
                });
            }
            debug!(%url, %id, "no plugin or file produced a load result");
            return Ok(None);
        }
    };

    let module = ctx.graph.ensure_entry_from_url(&url).await;
    if let Some(file) = &module.file {
        ctx.watch_file(file);
    }

    let out = ctx.container.transform(code, &id).await?;
    let code = out.code;
    let map = out.map.or(load_map);

    if !opts.html && module.kind == ModuleKind::Js {
        analyze_module(ctx, &module, &code).await?;
    }

    let map = match map {
        Some(m) => Some(fill_sources_content(m, module.file.as_deref()).await),
        None => None,
    };

    let result = TransformResult::new(code, map);
    let shared = if opts.ssr || opts.html {
        // flavored results are deduplicated but not cached on the node
        Arc::new(result)
    } else {
        ctx.graph.set_transform_result(&module.url, result)?
    };
    debug!(
        url,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transformed"
    );
    Ok(Some(shared))
}

/// Whether a URL that failed to load points at a file in the public
/// directory.
fn is_public_request(ctx: &ServerContext, url: &str) -> bool {
    let rel = clean_url(url).trim_start_matches('/');
    !rel.is_empty() && ctx.config.public_dir.join(rel).is_file()
}

/// Update the graph from a module's final code: import edges, accepted
/// deps, self-accept flag. Emits a prune payload for anything orphaned.
async fn analyze_module(
    ctx: &ServerContext,
    module: &ModuleNode,
    code: &str,
) -> Result<(), TransformError> {
    let records = match parse_module_records(code) {
        Ok(records) => records,
        Err(err) => {
            debug!(url = %module.url, %err, "import scan failed; keeping previous graph edges");
            return Ok(());
        }
    };

    let mut imported: FxHashSet<String> = FxHashSet::default();
    for record in &records.imports {
        if let Some(dep_url) = specifier_to_url(&module.url, &record.specifier) {
            imported.insert(dep_url);
        }
    }

    let mut accepted: FxHashSet<String> = FxHashSet::default();
    let mut is_self_accepting = false;
    for pos in &records.hot_accepts {
        let deps = lex_accepted_deps(code, *pos).map_err(|source| TransformError::Lex {
            id: module.resolved_id.clone(),
            source,
        })?;
        if deps.self_accepts {
            is_self_accepting = true;
        }
        for dep in deps.deps {
            if let Some(dep_url) = specifier_to_url(&module.url, &dep.url) {
                accepted.insert(dep_url);
            }
        }
    }

    let pruned =
        ctx.graph
            .update_module_info(&module.url, imported, accepted, is_self_accepting)?;
    if !pruned.is_empty() {
        crate::hmr::handle_prune(ctx, pruned).await;
    }
    Ok(())
}

/// Map an import specifier to a graph URL relative to its importer.
///
/// Bare specifiers return `None`; pre-bundling owns those.
fn specifier_to_url(owner_url: &str, spec: &str) -> Option<String> {
    if spec.starts_with('/') {
        return Some(spec.to_string());
    }
    if spec.starts_with("./") || spec.starts_with("../") {
        let (owner_path, _) = split_suffix(owner_url);
        let dir = Path::new(owner_path).parent().unwrap_or(Path::new("/"));
        let joined = dir.join(spec).clean();
        return Some(joined.display().to_string());
    }
    None
}

/// Locate a module's cached source map for `.map` sibling requests.
pub async fn lookup_source_map(ctx: &ServerContext, map_url: &str) -> Option<String> {
    let module_url = map_url.strip_suffix(".map")?;
    let module = ctx.graph.get_by_url(module_url).await?;
    module.transform_result.as_ref()?.map.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specifier_to_url_relative() {
        assert_eq!(
            specifier_to_url("/src/main.js", "./dep.js"),
            Some("/src/dep.js".to_string())
        );
        assert_eq!(
            specifier_to_url("/src/nested/mod.js", "../util.js"),
            Some("/src/util.js".to_string())
        );
    }

    #[test]
    fn test_specifier_to_url_absolute_and_bare() {
        assert_eq!(specifier_to_url("/a.js", "/b.js"), Some("/b.js".to_string()));
        assert_eq!(specifier_to_url("/a.js", "lodash-es"), None);
    }

    #[test]
    fn test_cache_keys_by_flavor() {
        let url = "/app.js";
        assert_eq!(cache_key(url, TransformOptions::default()), "/app.js");
        assert_eq!(
            cache_key(url, TransformOptions { ssr: true, html: false }),
            "ssr:/app.js"
        );
        assert_eq!(
            cache_key(url, TransformOptions { ssr: false, html: true }),
            "html:/app.js"
        );
    }
}
