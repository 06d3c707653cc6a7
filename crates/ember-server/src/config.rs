//! Resolved server configuration.
//!
//! The embedder loads and validates configuration however it likes (file,
//! CLI, programmatic); the core consumes this already-resolved record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// HMR channel settings injected into the browser client.
#[derive(Debug, Clone)]
pub struct HmrConfig {
    /// Keepalive ping interval / socket timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether the browser error overlay is enabled.
    pub overlay: bool,
    /// Override for the WebSocket protocol (`ws`/`wss`); `None` follows the
    /// page scheme.
    pub protocol: Option<String>,
    /// Override for the WebSocket host; `None` follows the page host.
    pub host: Option<String>,
    /// Override for the WebSocket port.
    pub port: Option<u16>,
}

impl Default for HmrConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            overlay: true,
            protocol: None,
            host: None,
            port: None,
        }
    }
}

/// Dependency scanning / pre-bundling knobs.
#[derive(Debug, Clone, Default)]
pub struct OptimizeDepsConfig {
    /// Explicit entry globs; highest precedence for scan entry discovery.
    pub entries: Vec<String>,
    /// Bundler input list; used when `entries` is empty.
    pub build_inputs: Vec<PathBuf>,
    /// Dependencies to always pre-bundle even if linked from source.
    pub include: Vec<String>,
    /// Dependencies never pre-bundled; treated as external during the scan.
    pub exclude: Vec<String>,
    /// Extra compile-time defines merged into the pre-bundle.
    pub define: BTreeMap<String, String>,
}

/// The resolved configuration the serving core runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Project root; served URLs resolve beneath it.
    pub root: PathBuf,
    /// Directory of verbatim-served static files.
    pub public_dir: PathBuf,
    /// Pre-bundle cache directory.
    pub cache_dir: PathBuf,
    /// Config file backing this configuration, if any. A change restarts the
    /// server.
    pub config_file: Option<PathBuf>,
    /// Files the config file loaded; changes also restart.
    pub config_deps: Vec<PathBuf>,
    /// Whether `.env*` file changes restart the server.
    pub handle_env_files: bool,
    /// On-disk client runtime directory, when the embedder serves the client
    /// from disk rather than the embedded asset.
    pub client_dir: Option<PathBuf>,
    /// Resolution mode, part of the optimizer hash ("development" here).
    pub mode: String,
    /// Extensions tried when resolving extensionless specifiers, in order.
    pub resolve_extensions: Vec<String>,
    /// Extra extensions treated as assets during scanning.
    pub assets_include: Vec<String>,
    pub hmr: HmrConfig,
    pub optimize: OptimizeDepsConfig,
}

impl ServerConfig {
    /// Build a configuration with conventional defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self {
            public_dir: root.join("public"),
            cache_dir: root.join("node_modules/.ember"),
            config_file: None,
            config_deps: Vec::new(),
            handle_env_files: true,
            client_dir: None,
            mode: "development".to_string(),
            resolve_extensions: ["js", "mjs", "jsx", "ts", "tsx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            assets_include: Vec::new(),
            hmr: HmrConfig::default(),
            optimize: OptimizeDepsConfig::default(),
            root,
        }
    }

    pub fn with_public_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.public_dir = dir.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_config_file(mut self, file: impl Into<PathBuf>, deps: Vec<PathBuf>) -> Self {
        self.config_file = Some(file.into());
        self.config_deps = deps;
        self
    }

    pub fn with_optimize(mut self, optimize: OptimizeDepsConfig) -> Self {
        self.optimize = optimize;
        self
    }

    /// Map a root-relative URL path to its location under the project root.
    pub fn root_path_for(&self, url_path: &str) -> PathBuf {
        self.root.join(url_path.trim_start_matches('/'))
    }

    /// Map a file under the root back to its URL path.
    pub fn url_path_for(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(&self.root).ok()?;
        Some(format!("/{}", rel.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("/srv/app");
        assert_eq!(config.public_dir, PathBuf::from("/srv/app/public"));
        assert_eq!(config.cache_dir, PathBuf::from("/srv/app/node_modules/.ember"));
        assert!(config.handle_env_files);
        assert_eq!(config.hmr.timeout_ms, 30_000);
    }

    #[test]
    fn test_url_path_round_trip() {
        let config = ServerConfig::new("/srv/app");
        let file = config.root_path_for("/src/main.js");
        assert_eq!(file, PathBuf::from("/srv/app/src/main.js"));
        assert_eq!(config.url_path_for(&file).unwrap(), "/src/main.js");
        assert!(config.url_path_for(Path::new("/elsewhere/x.js")).is_none());
    }
}
