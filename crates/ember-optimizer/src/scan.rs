//! Dependency scanner.
//!
//! Crawls from entry HTML/JS files to enumerate bare-module imports. The
//! crawl drives a [`ScanBackend`] (the seam to an external bundler) with a
//! [`ScanPlugin`] that intercepts resolution and loading: externals are cut
//! off, bare imports resolving into node_modules are recorded as deps,
//! linked sources keep being traversed, unresolvable bare imports land in
//! `missing`.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use path_clean::PathClean;
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::debug;
use walkdir::WalkDir;

use ember_server::lexer::{parse_module_records_with, Loader};
use ember_server::ServerConfig;

use crate::error::{OptimizeError, Result};

const JS_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "jsx", "ts", "tsx", "mts", "cts"];
const HTML_LIKE_EXTENSIONS: &[&str] = &["html", "htm", "vue", "svelte", "astro"];
const CSS_EXTENSIONS: &[&str] = &[
    "css", "less", "sass", "scss", "styl", "stylus", "pcss", "postcss",
];
const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "avif", "mp4", "webm", "ogg", "mp3",
    "wav", "flac", "aac", "woff", "woff2", "eot", "ttf", "otf", "wasm", "pdf", "json",
];
const SPECIAL_QUERIES: &[&str] = &["worker", "sharedworker", "raw", "url"];

/// What the scanner found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Raw dep id → resolved entry file.
    pub deps: BTreeMap<String, PathBuf>,
    /// Raw dep id → importer that failed to resolve it.
    pub missing: BTreeMap<String, String>,
}

/// Verdict for one specifier during the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResolution {
    /// Not traversed (URL, asset, CSS, excluded, special query).
    External,
    /// Recorded as a pre-bundle dep; not traversed.
    Dep,
    /// Project or linked source; keep crawling.
    File(PathBuf),
    /// Unresolvable bare import; recorded for diagnostics.
    Missing,
}

/// Bundler seam: drives the crawl over the entries using the plugin's
/// resolve/load interception.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    async fn scan(&self, entries: &[PathBuf], plugin: &ScanPlugin) -> Result<()>;
}

#[derive(Default)]
struct ScanState {
    deps: BTreeMap<String, PathBuf>,
    missing: BTreeMap<String, String>,
}

/// Resolution/loading interception shared with the backend.
pub struct ScanPlugin {
    root: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    assets_include: Vec<String>,
    state: Mutex<ScanState>,
}

impl ScanPlugin {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            root: config.root.clone(),
            include: config.optimize.include.clone(),
            exclude: config.optimize.exclude.clone(),
            assets_include: config.assets_include.clone(),
            state: Mutex::new(ScanState::default()),
        }
    }

    pub fn take_result(&self) -> ScanResult {
        let mut state = self.state.lock();
        ScanResult {
            deps: std::mem::take(&mut state.deps),
            missing: std::mem::take(&mut state.missing),
        }
    }

    /// Classify a specifier found in `importer`.
    pub fn resolve(&self, specifier: &str, importer: &Path) -> ScanResolution {
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("//")
            || specifier.starts_with("data:")
        {
            return ScanResolution::External;
        }
        let (path_part, query) = match specifier.find('?') {
            Some(i) => (&specifier[..i], &specifier[i + 1..]),
            None => (specifier, ""),
        };
        if query
            .split('&')
            .any(|pair| SPECIAL_QUERIES.contains(&pair.split('=').next().unwrap_or(pair)))
        {
            return ScanResolution::External;
        }
        if let Some(ext) = Path::new(path_part).extension().and_then(|e| e.to_str()) {
            if CSS_EXTENSIONS.contains(&ext)
                || ASSET_EXTENSIONS.contains(&ext)
                || self.assets_include.iter().any(|a| a == ext)
            {
                return ScanResolution::External;
            }
        }

        if is_bare_specifier(path_part) {
            let pkg = package_name(path_part);
            if self.exclude.iter().any(|e| e == pkg || e == path_part) {
                return ScanResolution::External;
            }
            return match resolve_bare(path_part, importer, &self.root) {
                Some(resolved) => {
                    let in_node_modules = resolved
                        .components()
                        .any(|c| c.as_os_str() == "node_modules");
                    if in_node_modules
                        || self.include.iter().any(|i| i == path_part || i == pkg)
                    {
                        self.state
                            .lock()
                            .deps
                            .insert(path_part.to_string(), resolved);
                        ScanResolution::Dep
                    } else {
                        // linked source outside node_modules: crawl through
                        ScanResolution::File(resolved)
                    }
                }
                None => {
                    self.state
                        .lock()
                        .missing
                        .insert(path_part.to_string(), importer.display().to_string());
                    ScanResolution::Missing
                }
            };
        }

        // relative or absolute path; absolute specifiers from HTML are
        // root-relative URLs first, literal paths second
        let candidate = if Path::new(path_part).is_absolute() {
            let rooted = self.root.join(path_part.trim_start_matches('/')).clean();
            if rooted.exists() {
                rooted
            } else {
                PathBuf::from(path_part)
            }
        } else {
            match importer.parent() {
                Some(dir) => dir.join(path_part).clean(),
                None => return ScanResolution::External,
            }
        };
        match resolve_file(&candidate) {
            Some(file) => ScanResolution::File(file),
            None => {
                debug!(specifier, importer = %importer.display(), "unresolved path during scan");
                ScanResolution::External
            }
        }
    }

    /// Load a file as crawlable JavaScript: script extraction for HTML-like
    /// files, raw content for JS-like files, `None` for everything else.
    pub async fn load(&self, file: &Path) -> Result<Option<String>> {
        let Some(ext) = file.extension().and_then(|e| e.to_str()) else {
            return Ok(None);
        };
        if HTML_LIKE_EXTENSIONS.contains(&ext) {
            let content = tokio::fs::read_to_string(file).await?;
            let is_html = matches!(ext, "html" | "htm");
            Ok(Some(extract_scripts(&content, is_html)))
        } else if JS_EXTENSIONS.contains(&ext) {
            Ok(Some(tokio::fs::read_to_string(file).await?))
        } else {
            Ok(None)
        }
    }

    /// Expand `import.meta.glob("<pattern>")` literals so globbed modules
    /// are crawled too.
    pub fn expand_globs(&self, file: &Path, content: &str) -> Vec<PathBuf> {
        static META_GLOB_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r#"import\.meta\.glob(?:Eager)?\(\s*['"]([^'"]+)['"]"#).unwrap()
        });

        let mut found = Vec::new();
        for cap in META_GLOB_RE.captures_iter(content) {
            let pattern = &cap[1];
            let base = if pattern.starts_with('/') {
                self.root.clone()
            } else {
                match file.parent() {
                    Some(dir) => dir.to_path_buf(),
                    None => continue,
                }
            };
            let normalized = pattern.trim_start_matches('/').trim_start_matches("./");
            let Ok(glob) = Glob::new(normalized) else {
                debug!(pattern, "skipping unparsable import.meta.glob pattern");
                continue;
            };
            let matcher = glob.compile_matcher();
            for entry in WalkDir::new(&base)
                .into_iter()
                .filter_entry(|e| e.file_name() != "node_modules")
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Ok(rel) = entry.path().strip_prefix(&base) {
                    if matcher.is_match(rel) {
                        found.push(entry.path().to_path_buf());
                    }
                }
            }
        }
        found
    }
}

/// Built-in work-queue crawler standing in for an external bundler.
///
/// Walks the static import graph with the shared lenient lexer; a real
/// bundler backend plugs into [`ScanBackend`] with the same plugin.
#[derive(Debug, Default)]
pub struct WorkQueueScanner;

#[async_trait]
impl ScanBackend for WorkQueueScanner {
    async fn scan(&self, entries: &[PathBuf], plugin: &ScanPlugin) -> Result<()> {
        let mut queue: VecDeque<PathBuf> = entries.iter().cloned().collect();
        let mut seen: FxHashSet<PathBuf> = FxHashSet::default();

        while let Some(file) = queue.pop_front() {
            if !seen.insert(file.clone()) {
                continue;
            }
            let Some(content) = plugin.load(&file).await? else {
                continue;
            };
            let records = parse_module_records_with(&content, Loader::Jsx)
                .expect("jsx loader is infallible");
            for record in records.imports {
                if let ScanResolution::File(next) = plugin.resolve(&record.specifier, &file) {
                    queue.push_back(next);
                }
            }
            for globbed in plugin.expand_globs(&file, &content) {
                queue.push_back(globbed);
            }
        }
        Ok(())
    }
}

/// Run the crawl: discover entries, drive the backend, collect the result.
pub async fn scan_imports(config: &ServerConfig, backend: &dyn ScanBackend) -> Result<ScanResult> {
    let entries = discover_entries(config)?;
    debug!(count = entries.len(), "scanning from entries");
    let plugin = ScanPlugin::new(config);
    backend.scan(&entries, &plugin).await?;
    let result = plugin.take_result();
    debug!(
        deps = result.deps.len(),
        missing = result.missing.len(),
        "scan complete"
    );
    Ok(result)
}

/// Entry discovery precedence: explicit entry globs > bundler inputs >
/// `**/*.html`.
pub fn discover_entries(config: &ServerConfig) -> Result<Vec<PathBuf>> {
    let root = &config.root;
    let candidates: Vec<PathBuf> = if !config.optimize.entries.is_empty() {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.optimize.entries {
            let glob = Glob::new(pattern).map_err(|e| OptimizeError::InvalidEntryPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| OptimizeError::InvalidEntryPattern {
                pattern: config.optimize.entries.join(", "),
                message: e.to_string(),
            })?;
        walk_root(root, |rel| set.is_match(rel))
    } else if !config.optimize.build_inputs.is_empty() {
        config
            .optimize
            .build_inputs
            .iter()
            .map(|input| {
                if input.is_absolute() {
                    input.clone()
                } else {
                    root.join(input)
                }
            })
            .collect()
    } else {
        walk_root(root, |rel| {
            matches!(
                rel.extension().and_then(|e| e.to_str()),
                Some("html") | Some("htm")
            )
        })
    };

    Ok(candidates
        .into_iter()
        .filter(|path| path.is_file() && is_scannable(path))
        .collect())
}

fn walk_root(root: &Path, pred: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != "node_modules" && !(name.starts_with('.') && e.depth() > 0)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| pred(rel))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn is_scannable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| JS_EXTENSIONS.contains(&ext) || HTML_LIKE_EXTENSIONS.contains(&ext))
}

fn is_bare_specifier(specifier: &str) -> bool {
    specifier
        .chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '@' || c == '_')
}

/// `@scope/name/deep` → `@scope/name`; `name/deep` → `name`.
fn package_name(specifier: &str) -> &str {
    let mut segments = specifier.splitn(3, '/');
    match (segments.next(), segments.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => {
            &specifier[..scope.len() + 1 + name.len()]
        }
        (Some(name), _) => name,
        (None, _) => specifier,
    }
}

/// Node-style resolution: walk node_modules directories upward from the
/// importer (and finally the root).
fn resolve_bare(specifier: &str, importer: &Path, root: &Path) -> Option<PathBuf> {
    let pkg = package_name(specifier);
    let subpath = specifier.strip_prefix(pkg).unwrap_or("").trim_start_matches('/');

    let mut search_dirs: Vec<PathBuf> = Vec::new();
    let mut dir = importer.parent().map(|p| p.to_path_buf());
    while let Some(current) = dir {
        search_dirs.push(current.clone());
        dir = current.parent().map(|p| p.to_path_buf());
    }
    if !search_dirs.iter().any(|d| d == root) {
        search_dirs.push(root.to_path_buf());
    }

    for base in search_dirs {
        let pkg_dir = base.join("node_modules").join(pkg);
        if !pkg_dir.is_dir() {
            continue;
        }
        if subpath.is_empty() {
            if let Some(entry) = package_entry(&pkg_dir) {
                return Some(entry);
            }
        } else if let Some(file) = resolve_file(&pkg_dir.join(subpath)) {
            return Some(file);
        }
    }
    None
}

/// Read a package's entry from `module`/`main`, falling back to index.js.
fn package_entry(pkg_dir: &Path) -> Option<PathBuf> {
    if let Ok(raw) = std::fs::read_to_string(pkg_dir.join("package.json")) {
        if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&raw) {
            for field in ["module", "main"] {
                if let Some(entry) = manifest.get(field).and_then(|v| v.as_str()) {
                    if let Some(file) = resolve_file(&pkg_dir.join(entry)) {
                        return Some(file);
                    }
                }
            }
        }
    }
    resolve_file(&pkg_dir.join("index"))
}

/// Try a path as-is, with JS extensions, then as a directory index.
fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if path.extension().is_none() {
        for ext in JS_EXTENSIONS {
            let candidate = PathBuf::from(format!("{}.{}", path.display(), ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        for ext in JS_EXTENSIONS {
            let candidate = path.join(format!("index.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script([^>]*)>(.*?)</script>").unwrap());
static SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bsrc\s*=\s*["']([^"']+)["']"#).unwrap());
static TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\btype\s*=\s*["']([^"']+)["']"#).unwrap());

/// Extract crawlable JavaScript from an HTML-like file.
///
/// HTML proper only contributes `<script type="module">`; single-file
/// components contribute every plain `<script>`. `src=` references become
/// side-effect imports. For component files the collected imports are
/// re-emitted bare so template-only bindings survive a bundler's
/// dead-code elimination.
fn extract_scripts(content: &str, is_html: bool) -> String {
    let mut out = String::new();
    for cap in SCRIPT_RE.captures_iter(content) {
        let attrs = &cap[1];
        let body = &cap[2];

        let type_attr = TYPE_RE.captures(attrs).map(|c| c[1].to_lowercase());
        match type_attr.as_deref() {
            Some("module") => {}
            Some(_) => continue,
            None if is_html => continue,
            None => {}
        }

        if let Some(src) = SRC_RE.captures(attrs) {
            out.push_str(&format!("import '{}';\n", &src[1]));
        } else {
            out.push_str(body);
            out.push('\n');
        }
    }
    if !is_html {
        if let Ok(records) = parse_module_records_with(&out, Loader::Jsx) {
            for record in records.imports {
                out.push_str(&format!("import '{}';\n", record.specifier));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("lodash-es"), "lodash-es");
        assert_eq!(package_name("lodash-es/map"), "lodash-es");
        assert_eq!(package_name("@scope/pkg"), "@scope/pkg");
        assert_eq!(package_name("@scope/pkg/deep/mod"), "@scope/pkg");
    }

    #[test]
    fn test_bare_detection() {
        assert!(is_bare_specifier("react"));
        assert!(is_bare_specifier("@scope/pkg"));
        assert!(!is_bare_specifier("./local.js"));
        assert!(!is_bare_specifier("/abs.js"));
        assert!(!is_bare_specifier("../up.js"));
    }

    #[test]
    fn test_extract_scripts_html_module_only() {
        let html = r#"
            <html><body>
            <script type="module">import './main.js';</script>
            <script>legacy();</script>
            <script type="application/ld+json">{"@context": "x"}</script>
            <script type="module" src="/src/entry.ts"></script>
            </body></html>
        "#;
        let out = extract_scripts(html, true);
        assert!(out.contains("import './main.js';"));
        assert!(out.contains("import '/src/entry.ts';"));
        assert!(!out.contains("legacy"));
        assert!(!out.contains("@context"));
    }

    #[test]
    fn test_extract_scripts_sfc_appends_bare_reimports() {
        let vue = r#"
            <template><Widget /></template>
            <script>
            import Widget from './Widget.vue';
            export default { components: { Widget } }
            </script>
        "#;
        let out = extract_scripts(vue, false);
        assert!(out.contains("import Widget from './Widget.vue';"));
        assert!(out.contains("import './Widget.vue';"));
    }

    #[test]
    fn test_scan_resolution_externals() {
        let config = ServerConfig::new("/srv/app");
        let plugin = ScanPlugin::new(&config);
        let importer = Path::new("/srv/app/src/main.js");

        assert_eq!(
            plugin.resolve("https://cdn.example.com/lib.js", importer),
            ScanResolution::External
        );
        assert_eq!(
            plugin.resolve("data:text/javascript,void 0", importer),
            ScanResolution::External
        );
        assert_eq!(
            plugin.resolve("./styles.css", importer),
            ScanResolution::External
        );
        assert_eq!(
            plugin.resolve("./logo.png", importer),
            ScanResolution::External
        );
        assert_eq!(
            plugin.resolve("./worker.js?worker", importer),
            ScanResolution::External
        );
        assert_eq!(
            plugin.resolve("./data.js?raw", importer),
            ScanResolution::External
        );
    }

    #[test]
    fn test_excluded_bare_import_is_external() {
        let mut config = ServerConfig::new("/srv/app");
        config.optimize.exclude = vec!["my-runtime-pkg".to_string()];
        let plugin = ScanPlugin::new(&config);
        assert_eq!(
            plugin.resolve("my-runtime-pkg", Path::new("/srv/app/src/main.js")),
            ScanResolution::External
        );
    }

    #[test]
    fn test_missing_bare_import_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(dir.path());
        let plugin = ScanPlugin::new(&config);
        let importer = dir.path().join("src/main.js");

        assert_eq!(
            plugin.resolve("not-installed", &importer),
            ScanResolution::Missing
        );
        let result = plugin.take_result();
        assert!(result.missing.contains_key("not-installed"));
    }

    #[test]
    fn test_resolve_bare_through_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/lodash-es");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(
            pkg.join("package.json"),
            r#"{"name":"lodash-es","module":"lodash.js"}"#,
        )
        .unwrap();
        std::fs::write(pkg.join("lodash.js"), "export default {}").unwrap();

        let config = ServerConfig::new(dir.path());
        let plugin = ScanPlugin::new(&config);
        let importer = dir.path().join("src/main.js");

        assert_eq!(
            plugin.resolve("lodash-es", &importer),
            ScanResolution::Dep
        );
        let result = plugin.take_result();
        assert_eq!(result.deps["lodash-es"], pkg.join("lodash.js"));
    }

    #[test]
    fn test_entry_discovery_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("src/main.ts"), "").unwrap();

        // html fallback
        let config = ServerConfig::new(dir.path());
        let entries = discover_entries(&config).unwrap();
        assert_eq!(entries, vec![dir.path().join("index.html")]);

        // explicit globs win
        let mut config = ServerConfig::new(dir.path());
        config.optimize.entries = vec!["src/*.ts".to_string()];
        let entries = discover_entries(&config).unwrap();
        assert_eq!(entries, vec![dir.path().join("src/main.ts")]);

        // bundler inputs beat the html fallback
        let mut config = ServerConfig::new(dir.path());
        config.optimize.build_inputs = vec![PathBuf::from("src/main.ts")];
        let entries = discover_entries(&config).unwrap();
        assert_eq!(entries, vec![dir.path().join("src/main.ts")]);
    }
}
