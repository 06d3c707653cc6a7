//! Pre-bundle optimizer.
//!
//! Bundles scanned dependencies into the cache directory in one amortized
//! pass, keyed by a content hash over the lockfile and the relevant config
//! subset. Newly discovered runtime deps re-enter through
//! [`DepOptimizer::register_missing_import`], which gates in-flight
//! transforms behind the server's pending-reload window while re-bundling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use ember_server::lexer::{parse_module_records, parse_module_records_with, Loader, ModuleRecords};
use ember_server::ws::HmrPayload;
use ember_server::{ServerConfig, ServerContext};

use crate::error::{OptimizeError, Result};
use crate::metadata::{DepMetadata, OptimizedDep};
use crate::scan::{scan_imports, ScanBackend};

/// Dep ids that always need interop wrapping regardless of what their
/// sources look like.
const KNOWN_INTEROP_IDS: &[&str] = &["react", "react-dom", "moment"];

const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    "bun.lock",
];

/// One bundling invocation handed to the backend.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// Flat id → dependency entry file. Output format is always ESM.
    pub entries: BTreeMap<String, PathBuf>,
    pub out_dir: PathBuf,
    pub splitting: bool,
    pub sourcemap: bool,
    pub metafile: bool,
    /// Compile-time constants, `process.env.NODE_ENV` included.
    pub define: BTreeMap<String, String>,
}

/// Per-entry information reported back by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledEntry {
    pub file: PathBuf,
    pub exports: Vec<String>,
    pub has_imports: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOutput {
    /// Flat id → bundled entry.
    pub outputs: BTreeMap<String, BundledEntry>,
}

/// Bundler seam for the optimizer; only this interface of the external
/// bundler is consumed.
#[async_trait]
pub trait BundleBackend: Send + Sync {
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput>;
}

/// Built-in backend that materializes each dep entry verbatim as one flat
/// ESM file.
///
/// No graph bundling happens; defines are applied textually and a stub map
/// is emitted. Real deployments plug a proper bundler into
/// [`BundleBackend`]; tests and zero-dependency setups use this.
#[derive(Debug, Default)]
pub struct PassthroughBackend;

#[async_trait]
impl BundleBackend for PassthroughBackend {
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput> {
        let mut outputs = BTreeMap::new();
        for (flat, src) in &request.entries {
            let mut code = tokio::fs::read_to_string(src).await?;
            for (key, value) in &request.define {
                code = code.replace(key, value);
            }
            let out_file = request.out_dir.join(format!("{flat}.js"));
            tokio::fs::write(&out_file, &code).await?;
            if request.sourcemap {
                let map = serde_json::json!({
                    "version": 3,
                    "sources": [src.display().to_string()],
                    "names": [],
                    "mappings": "",
                });
                tokio::fs::write(
                    request.out_dir.join(format!("{flat}.js.map")),
                    map.to_string(),
                )
                .await?;
            }
            let records =
                parse_module_records_with(&code, Loader::Jsx).expect("jsx loader is infallible");
            let has_imports = records.has_imports();
            outputs.insert(
                flat.clone(),
                BundledEntry {
                    file: out_file,
                    exports: records.exports,
                    has_imports,
                },
            );
        }
        Ok(BundleOutput { outputs })
    }
}

/// Make a dep id filename-safe: `/` and `>` become `_`.
pub fn flatten_id(raw: &str) -> String {
    raw.replace(['/', '>'], "_")
}

/// Hash over lockfile contents and the config subset that affects bundling.
pub fn compute_main_hash(config: &ServerConfig, plugin_names: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for name in LOCKFILES {
        if let Ok(bytes) = std::fs::read(config.root.join(name)) {
            hasher.update(name.as_bytes());
            hasher.update(&bytes);
        }
    }
    let subset = serde_json::json!({
        "mode": config.mode,
        "root": config.root,
        "resolveExtensions": config.resolve_extensions,
        "assetsInclude": config.assets_include,
        "plugins": plugin_names,
        "include": config.optimize.include,
        "exclude": config.optimize.exclude,
    });
    hasher.update(subset.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Short hash that also covers the dep set; changing it invalidates
/// browser-side URLs without touching disk artifacts keyed by `main_hash`.
fn compute_browser_hash(main_hash: &str, deps: &BTreeMap<String, PathBuf>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(main_hash.as_bytes());
    hasher.update(
        serde_json::to_string(deps)
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.finalize().to_hex().as_str()[..8].to_string()
}

fn is_single_default(exports: &[String]) -> bool {
    exports.len() == 1 && exports[0] == "default"
}

/// Decide whether consumers need CJS/UMD interop for a dep.
fn detect_interop(raw: &str, source: &ModuleRecords, bundled: Option<&BundledEntry>) -> bool {
    if KNOWN_INTEROP_IDS.contains(&raw) {
        return true;
    }
    // neither imports nor exports: almost certainly CJS or UMD
    if source.imports.is_empty() && source.exports.is_empty() && !source.has_re_exports {
        return true;
    }
    if let Some(bundled) = bundled {
        if is_single_default(&bundled.exports)
            && !(is_single_default(&source.exports) && !source.has_re_exports)
        {
            return true;
        }
    }
    false
}

/// Run one optimization pass.
///
/// Skips entirely when not forced, no runtime deps were handed in, and the
/// persisted metadata hash still matches. Otherwise resets the cache
/// directory, scans (unless `new_deps` short-circuits it), bundles in one
/// backend invocation, and persists fresh metadata.
pub async fn optimize_deps(
    ctx: &ServerContext,
    force: bool,
    new_deps: Option<BTreeMap<String, PathBuf>>,
    scan_backend: &dyn ScanBackend,
    bundle_backend: &dyn BundleBackend,
) -> Result<DepMetadata> {
    let config = &ctx.config;
    let cache_dir = &config.cache_dir;
    let main_hash = compute_main_hash(config, &ctx.container.plugin_names());

    if !force && new_deps.is_none() {
        if let Some(prev) = DepMetadata::load(cache_dir) {
            if prev.hash == main_hash {
                info!("using previously optimized dependencies");
                return Ok(prev);
            }
            debug!("optimizer hash changed, re-bundling");
        }
    }

    if cache_dir.exists() {
        std::fs::remove_dir_all(cache_dir)?;
    }
    std::fs::create_dir_all(cache_dir)?;
    // files in the cache dir are ES modules regardless of the project type
    std::fs::write(
        cache_dir.join("package.json"),
        "{\n  \"type\": \"module\"\n}\n",
    )?;

    let deps = match new_deps {
        Some(deps) => deps,
        None => {
            let result = scan_imports(config, scan_backend).await?;
            if !result.missing.is_empty() {
                let listing = result
                    .missing
                    .iter()
                    .map(|(dep, importer)| format!("  {dep} (imported by {importer})"))
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(OptimizeError::MissingDeps { listing });
            }
            result.deps
        }
    };

    let browser_hash = compute_browser_hash(&main_hash, &deps);

    let mut source_records: BTreeMap<String, ModuleRecords> = BTreeMap::new();
    for (raw, src) in &deps {
        let code = std::fs::read_to_string(src)?;
        let records = match parse_module_records(&code) {
            Ok(records) => records,
            Err(err) => {
                debug!(dep = %raw, %err, "strict parse failed, retrying with jsx loader");
                parse_module_records_with(&code, Loader::Jsx).map_err(|e| {
                    OptimizeError::DepParse {
                        dep: raw.clone(),
                        message: e.to_string(),
                    }
                })?
            }
        };
        source_records.insert(raw.clone(), records);
    }

    let entries: BTreeMap<String, PathBuf> = deps
        .iter()
        .map(|(raw, src)| (flatten_id(raw), src.clone()))
        .collect();
    let mut define = BTreeMap::new();
    define.insert(
        "process.env.NODE_ENV".to_string(),
        format!("\"{}\"", config.mode),
    );
    define.extend(config.optimize.define.clone());

    let request = BundleRequest {
        entries,
        out_dir: cache_dir.clone(),
        splitting: true,
        sourcemap: true,
        metafile: true,
        define,
    };
    let output = bundle_backend.bundle(&request).await?;

    let mut optimized = BTreeMap::new();
    for (raw, src) in &deps {
        let flat = flatten_id(raw);
        let needs_interop = detect_interop(raw, &source_records[raw], output.outputs.get(&flat));
        optimized.insert(
            raw.clone(),
            OptimizedDep {
                file: cache_dir.join(format!("{flat}.js")),
                src: src.clone(),
                needs_interop,
            },
        );
    }

    let metadata = DepMetadata {
        hash: main_hash,
        browser_hash,
        optimized,
    };
    metadata.save(cache_dir)?;
    info!(count = metadata.optimized.len(), "dependencies pre-bundled");
    Ok(metadata)
}

#[derive(Default)]
struct OptimizerState {
    metadata: Option<DepMetadata>,
    discovered: BTreeMap<String, PathBuf>,
}

/// Long-lived optimizer handle: initial pass plus the runtime-discovery
/// path.
pub struct DepOptimizer {
    ctx: Arc<ServerContext>,
    scan_backend: Arc<dyn ScanBackend>,
    bundle_backend: Arc<dyn BundleBackend>,
    state: Mutex<OptimizerState>,
}

impl DepOptimizer {
    pub fn new(
        ctx: Arc<ServerContext>,
        scan_backend: Arc<dyn ScanBackend>,
        bundle_backend: Arc<dyn BundleBackend>,
    ) -> Self {
        Self {
            ctx,
            scan_backend,
            bundle_backend,
            state: Mutex::new(OptimizerState::default()),
        }
    }

    /// Initial (or forced) pass.
    pub async fn run(&self, force: bool) -> Result<DepMetadata> {
        let metadata = optimize_deps(
            &self.ctx,
            force,
            None,
            self.scan_backend.as_ref(),
            self.bundle_backend.as_ref(),
        )
        .await?;
        self.state.lock().await.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    pub async fn metadata(&self) -> Option<DepMetadata> {
        self.state.lock().await.metadata.clone()
    }

    /// Look up one optimized dep by raw id.
    pub async fn resolve_dep(&self, raw: &str) -> Option<OptimizedDep> {
        self.state
            .lock()
            .await
            .metadata
            .as_ref()
            .and_then(|m| m.optimized.get(raw).cloned())
    }

    /// A transform met a bare import the bundle does not cover: merge it in
    /// and re-bundle.
    ///
    /// Publishes the pending-reload gate for the duration, invalidates all
    /// cached transforms on success (their import rewrites reference the old
    /// browser hash), and instructs the client to fully reload. On failure
    /// the previous metadata stays in effect.
    pub async fn register_missing_import(
        &self,
        raw: String,
        resolved: PathBuf,
    ) -> Result<DepMetadata> {
        info!(dep = %raw, "new dependency discovered at runtime, re-bundling");
        let pending = self.ctx.begin_pending_reload();

        let all_deps = {
            let mut state = self.state.lock().await;
            state.discovered.insert(raw, resolved);
            let mut all: BTreeMap<String, PathBuf> = state
                .metadata
                .as_ref()
                .map(|m| {
                    m.optimized
                        .iter()
                        .map(|(k, v)| (k.clone(), v.src.clone()))
                        .collect()
                })
                .unwrap_or_default();
            all.extend(state.discovered.clone());
            all
        };

        let result = optimize_deps(
            &self.ctx,
            false,
            Some(all_deps),
            self.scan_backend.as_ref(),
            self.bundle_backend.as_ref(),
        )
        .await;

        let _ = pending.send(true);
        self.ctx.finish_pending_reload();

        match result {
            Ok(metadata) => {
                self.state.lock().await.metadata = Some(metadata.clone());
                self.ctx.graph.invalidate_all();
                self.ctx
                    .broadcast(&HmrPayload::FullReload { path: None })
                    .await;
                Ok(metadata)
            }
            Err(err) => {
                error!(%err, "runtime dependency optimization failed; keeping previous bundle");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(code: &str) -> ModuleRecords {
        parse_module_records(code).unwrap()
    }

    #[test]
    fn test_flatten_id() {
        assert_eq!(flatten_id("lodash-es"), "lodash-es");
        assert_eq!(flatten_id("@scope/pkg"), "@scope_pkg");
        assert_eq!(flatten_id("pkg/deep/mod"), "pkg_deep_mod");
        assert_eq!(flatten_id("a > b"), "a _ b");
    }

    #[test]
    fn test_interop_known_ids() {
        let esm = records("export const x = 1;");
        assert!(detect_interop("react", &esm, None));
    }

    #[test]
    fn test_interop_cjs_shape() {
        let cjs = records("module.exports = { a: 1 };");
        assert!(detect_interop("some-cjs", &cjs, None));
    }

    #[test]
    fn test_interop_esm_passes() {
        let esm = records("import x from 'dep'; export const y = x;");
        assert!(!detect_interop("modern-pkg", &esm, None));
    }

    #[test]
    fn test_interop_default_collapse() {
        let source = records("export const a = 1; export const b = 2;");
        let bundled = BundledEntry {
            file: PathBuf::from("/cache/pkg.js"),
            exports: vec!["default".to_string()],
            has_imports: false,
        };
        assert!(detect_interop("umd-pkg", &source, Some(&bundled)));

        let default_only = records("export default 1;");
        let bundled_default = BundledEntry {
            file: PathBuf::from("/cache/pkg.js"),
            exports: vec!["default".to_string()],
            has_imports: false,
        };
        assert!(!detect_interop("default-pkg", &default_only, Some(&bundled_default)));
    }

    #[test]
    fn test_browser_hash_covers_deps() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), PathBuf::from("/n/a/index.js"));
        let one = compute_browser_hash("mainhash", &deps);
        deps.insert("b".to_string(), PathBuf::from("/n/b/index.js"));
        let two = compute_browser_hash("mainhash", &deps);
        assert_ne!(one, two);
        assert_eq!(one.len(), 8);
    }
}
