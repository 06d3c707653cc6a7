//! Transform pipeline integration over a real (temporary) project tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use ember_graph::weak_etag;
use ember_server::transform::{transform_request, TransformOptions};
use ember_server::{
    Plugin, ServerConfig, ServerContext, TransformError, TransformHookOutput,
};

fn project() -> (TempDir, Arc<ServerContext>) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::create_dir_all(dir.path().join("public")).unwrap();
    std::fs::write(
        dir.path().join("src/main.js"),
        "import './dep.js';\nimport.meta.hot.accept('./dep.js', (m) => {});\nexport const main = 1;\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("src/dep.js"), "export const dep = 2;\n").unwrap();
    std::fs::write(dir.path().join("public/logo.svg"), "<svg/>").unwrap();

    let config = ServerConfig::new(dir.path());
    let ctx = ServerContext::new(config, vec![]);
    (dir, ctx)
}

#[tokio::test]
async fn transform_serves_and_caches() {
    let (_dir, ctx) = project();

    let result = transform_request(&ctx, "/src/main.js", TransformOptions::default())
        .await
        .unwrap()
        .expect("module should load");
    assert!(result.code.contains("export const main"));
    assert_eq!(result.etag, weak_etag(&result.code));

    // second request is served from the node cache (same shared result)
    let again = transform_request(&ctx, "/src/main.js", TransformOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&result, &again));
}

#[tokio::test]
async fn transform_updates_graph_edges_and_accepts() {
    let (_dir, ctx) = project();

    transform_request(&ctx, "/src/main.js", TransformOptions::default())
        .await
        .unwrap()
        .unwrap();

    let node = ctx.graph.get("/src/main.js").expect("node created");
    assert!(node.imported_modules.contains("/src/dep.js"));
    assert!(node.accepted_hmr_deps.contains("/src/dep.js"));
    assert!(!node.is_self_accepting);

    let dep = ctx.graph.get("/src/dep.js").expect("dep discovered");
    assert!(dep.importers.contains("/src/main.js"));
}

#[tokio::test]
async fn timestamp_query_is_stripped() {
    let (_dir, ctx) = project();
    let result = transform_request(
        &ctx,
        "/src/dep.js?t=1699999999999",
        TransformOptions::default(),
    )
    .await
    .unwrap();
    assert!(result.is_some());
    assert!(ctx.graph.get("/src/dep.js").is_some());
}

#[tokio::test]
async fn missing_module_is_none() {
    let (_dir, ctx) = project();
    let result = transform_request(&ctx, "/src/ghost.js", TransformOptions::default())
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn public_path_misuse_is_an_error() {
    let (_dir, ctx) = project();
    let err = transform_request(&ctx, "/logo.svg", TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransformError::PublicPathMisuse { .. }));
}

struct SlowCountingPlugin {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for SlowCountingPlugin {
    fn name(&self) -> &str {
        "slow-counting"
    }
    async fn transform(
        &self,
        code: &str,
        id: &str,
    ) -> anyhow::Result<Option<TransformHookOutput>> {
        if id.ends_with("dep.js") {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            return Ok(Some(TransformHookOutput {
                code: format!("/* slow */\n{code}"),
                map: None,
            }));
        }
        Ok(None)
    }
}

#[tokio::test]
async fn concurrent_requests_deduplicate() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dep.js"), "export const x = 1;\n").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::new(
        ServerConfig::new(dir.path()),
        vec![Arc::new(SlowCountingPlugin {
            calls: Arc::clone(&calls),
        })],
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            transform_request(&ctx, "/dep.js", TransformOptions::default()).await
        }));
    }
    let mut etags = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap().unwrap();
        etags.push(result.etag.clone());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "one computation per key");
    assert!(etags.windows(2).all(|w| w[0] == w[1]));
}

struct FailingTransform;

#[async_trait]
impl Plugin for FailingTransform {
    fn name(&self) -> &str {
        "failing-transform"
    }
    async fn transform(
        &self,
        _code: &str,
        id: &str,
    ) -> anyhow::Result<Option<TransformHookOutput>> {
        if id.ends_with("bad.js") {
            anyhow::bail!("synthetic failure");
        }
        Ok(None)
    }
}

#[tokio::test]
async fn failed_transform_leaves_no_cache_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.js"), "export const x = 1;\n").unwrap();
    std::fs::write(dir.path().join("good.js"), "export const y = 2;\n").unwrap();

    let ctx = ServerContext::new(
        ServerConfig::new(dir.path()),
        vec![Arc::new(FailingTransform)],
    );

    let err = transform_request(&ctx, "/bad.js", TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransformError::Plugin { .. }));

    // the failure never corrupted other modules or stuck the dedup map
    if let Some(node) = ctx.graph.get("/bad.js") {
        assert!(node.transform_result.is_none());
    }
    let good = transform_request(&ctx, "/good.js", TransformOptions::default())
        .await
        .unwrap();
    assert!(good.is_some());

    // a retry of the failed URL runs again rather than replaying the error
    let err2 = transform_request(&ctx, "/bad.js", TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err2, TransformError::Plugin { .. }));
}

#[tokio::test]
async fn extensionless_urls_collapse_onto_one_node() {
    let (_dir, ctx) = project();

    transform_request(&ctx, "/src/dep", TransformOptions::default())
        .await
        .unwrap()
        .expect("resolves via extension guessing");
    transform_request(&ctx, "/src/dep.js", TransformOptions::default())
        .await
        .unwrap()
        .unwrap();

    let urls: Vec<String> = ctx
        .graph
        .urls()
        .into_iter()
        .filter(|u| u.contains("dep"))
        .collect();
    assert_eq!(urls, vec!["/src/dep.js".to_string()]);
}
