//! Built-in plugins.
//!
//! The serving core ships one internal plugin: a filesystem resolver that
//! maps root-relative and relative specifiers onto files under the project
//! root. It runs in the `post` bucket so user plugins get first refusal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use path_clean::PathClean;

use ember_graph::url::{clean_url, split_suffix, FS_PREFIX};

use crate::plugins::{Plugin, PluginEnforce, ResolveIdResult};

/// Resolves URLs and relative specifiers to absolute file paths.
pub struct FsResolvePlugin {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsResolvePlugin {
    pub fn new(root: PathBuf, extensions: Vec<String>) -> Self {
        Self { root, extensions }
    }

    /// Try the path as-is, then with each configured extension, then as a
    /// directory index.
    async fn try_resolve_file(&self, path: &Path) -> Option<PathBuf> {
        if tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
            return Some(path.to_path_buf());
        }
        if path.extension().is_none() {
            for ext in &self.extensions {
                let candidate = PathBuf::from(format!("{}.{}", path.display(), ext));
                if tokio::fs::metadata(&candidate)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    return Some(candidate);
                }
            }
            for ext in &self.extensions {
                let candidate = path.join(format!("index.{ext}"));
                if tokio::fs::metadata(&candidate)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[async_trait]
impl Plugin for FsResolvePlugin {
    fn name(&self) -> &str {
        "ember:fs-resolve"
    }

    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Post
    }

    async fn resolve_id(
        &self,
        source: &str,
        importer: Option<&str>,
    ) -> anyhow::Result<Option<ResolveIdResult>> {
        let (path_part, suffix) = split_suffix(source);

        // /@fs/ URLs address absolute paths directly
        if let Some(rest) = path_part.strip_prefix(FS_PREFIX) {
            let abs = PathBuf::from(format!("/{rest}")).clean();
            return Ok(Some(ResolveIdResult::id(format!(
                "{}{suffix}",
                abs.display()
            ))));
        }

        // relative specifiers resolve against the importer's directory
        if path_part.starts_with("./") || path_part.starts_with("../") {
            if let Some(importer) = importer {
                let base = PathBuf::from(clean_url(importer));
                if let Some(dir) = base.parent() {
                    let candidate = dir.join(path_part).clean();
                    if let Some(file) = self.try_resolve_file(&candidate).await {
                        return Ok(Some(ResolveIdResult::id(format!(
                            "{}{suffix}",
                            file.display()
                        ))));
                    }
                }
            }
            return Ok(None);
        }

        // root-relative URLs resolve under the project root
        if let Some(rel) = path_part.strip_prefix('/') {
            let candidate = self.root.join(rel).clean();
            // stay inside the root even for crafted ../ paths
            if !candidate.starts_with(&self.root) {
                return Ok(None);
            }
            if let Some(file) = self.try_resolve_file(&candidate).await {
                return Ok(Some(ResolveIdResult::id(format!(
                    "{}{suffix}",
                    file.display()
                ))));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(root: &Path) -> FsResolvePlugin {
        FsResolvePlugin::new(root.to_path_buf(), vec!["js".into(), "ts".into()])
    }

    #[tokio::test]
    async fn test_resolves_root_relative_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), "").unwrap();

        let p = plugin(dir.path());
        let resolved = p.resolve_id("/src/main.js", None).await.unwrap().unwrap();
        let ResolveIdResult::Id { id, .. } = resolved else {
            panic!("expected id");
        };
        assert_eq!(id, dir.path().join("src/main.js").display().to_string());
    }

    #[tokio::test]
    async fn test_extension_guessing_and_query_preserved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.ts"), "").unwrap();

        let p = plugin(dir.path());
        let resolved = p.resolve_id("/util?import", None).await.unwrap().unwrap();
        let ResolveIdResult::Id { id, .. } = resolved else {
            panic!("expected id");
        };
        assert_eq!(
            id,
            format!("{}?import", dir.path().join("util.ts").display())
        );
    }

    #[tokio::test]
    async fn test_relative_against_importer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/dep.js"), "").unwrap();

        let p = plugin(dir.path());
        let importer = dir.path().join("src/main.js").display().to_string();
        let resolved = p
            .resolve_id("./dep.js", Some(&importer))
            .await
            .unwrap()
            .unwrap();
        let ResolveIdResult::Id { id, .. } = resolved else {
            panic!("expected id");
        };
        assert_eq!(id, dir.path().join("src/dep.js").display().to_string());
    }

    #[tokio::test]
    async fn test_escaping_root_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let p = plugin(dir.path());
        assert!(p.resolve_id("/../etc/passwd", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bare_specifier_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let p = plugin(dir.path());
        assert!(p.resolve_id("lodash-es", None).await.unwrap().is_none());
    }
}
