//! File system watcher adapter.
//!
//! The HMR propagator consumes a single ordered stream of [`FileChange`]
//! events; this adapter produces that stream from a `notify` watcher,
//! filtering out node_modules, dot-files, and the pre-bundle cache
//! directory, and debouncing editor write bursts per file.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::ServerError;

/// One file event, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Modified(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
}

impl FileChange {
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Modified(p) | FileChange::Created(p) | FileChange::Removed(p) => p,
        }
    }
}

/// Recursive watcher over the project root.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Watch `root` recursively; `ignored_dirs` are skipped by prefix (the
    /// pre-bundle cache directory belongs in here).
    ///
    /// Returns the watcher handle and the event stream the propagator
    /// drains.
    pub fn new(
        root: PathBuf,
        ignored_dirs: Vec<PathBuf>,
        debounce_ms: u64,
    ) -> Result<(Self, mpsc::Receiver<FileChange>), ServerError> {
        if !root.exists() {
            return Err(ServerError::Custom(format!(
                "watch root does not exist: {}",
                root.display()
            )));
        }

        let (tx, rx) = mpsc::channel(256);
        let debounce = Duration::from_millis(debounce_ms);
        let mut last_event: Option<(PathBuf, Instant)> = None;
        let root_clone = root.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            for path in &event.paths {
                if Self::should_ignore(path, &root_clone, &ignored_dirs) {
                    continue;
                }
                let now = Instant::now();
                if let Some((last_path, last_time)) = &last_event {
                    if last_path == path && now.duration_since(*last_time) < debounce {
                        continue;
                    }
                }
                last_event = Some((path.clone(), now));

                let change = match event.kind {
                    notify::EventKind::Create(_) => FileChange::Created(path.clone()),
                    notify::EventKind::Modify(_) => FileChange::Modified(path.clone()),
                    notify::EventKind::Remove(_) => FileChange::Removed(path.clone()),
                    _ => continue,
                };
                let _ = tx.blocking_send(change);
            }
        })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok((Self { watcher, root }, rx))
    }

    /// Cover one extra path (a served file outside the root, e.g. behind an
    /// `/@fs/` URL).
    pub fn watch_path(&mut self, path: &Path) -> Result<(), ServerError> {
        if path.starts_with(&self.root) {
            return Ok(());
        }
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn should_ignore(path: &Path, root: &Path, ignored_dirs: &[PathBuf]) -> bool {
        if ignored_dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            // extra watched paths outside the root are always relevant
            return false;
        };
        for component in rel.components() {
            let Some(name) = component.as_os_str().to_str() else {
                return true;
            };
            if name == "node_modules" {
                return true;
            }
            if name.starts_with('.') && !name.starts_with(".env") {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignores_node_modules_and_dotdirs() {
        let root = PathBuf::from("/project");
        let none: Vec<PathBuf> = vec![];
        assert!(FileWatcher::should_ignore(
            Path::new("/project/node_modules/pkg/index.js"),
            &root,
            &none,
        ));
        assert!(FileWatcher::should_ignore(
            Path::new("/project/.git/HEAD"),
            &root,
            &none,
        ));
        assert!(!FileWatcher::should_ignore(
            Path::new("/project/src/main.js"),
            &root,
            &none,
        ));
    }

    #[test]
    fn test_env_files_are_not_ignored() {
        let root = PathBuf::from("/project");
        let none: Vec<PathBuf> = vec![];
        assert!(!FileWatcher::should_ignore(
            Path::new("/project/.env.local"),
            &root,
            &none,
        ));
    }

    #[test]
    fn test_ignores_cache_dir() {
        let root = PathBuf::from("/project");
        let ignored = vec![PathBuf::from("/project/node_modules/.ember")];
        assert!(FileWatcher::should_ignore(
            Path::new("/project/node_modules/.ember/dep.js"),
            &root,
            &ignored,
        ));
    }

    #[tokio::test]
    async fn test_emits_events_for_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) =
            FileWatcher::new(dir.path().to_path_buf(), vec![], 0).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("a.js"), "export {}").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should deliver an event")
            .expect("channel open");
        assert!(change.path().ends_with("a.js"));
    }
}
