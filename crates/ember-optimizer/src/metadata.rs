//! Pre-bundle metadata, persisted next to the cache artifacts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Name of the metadata record inside the cache directory.
pub const METADATA_FILE: &str = "_metadata.json";

/// One pre-bundled dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedDep {
    /// Bundled artifact inside the cache directory.
    pub file: PathBuf,
    /// Source entry the bundle was built from.
    pub src: PathBuf,
    /// Whether consumers need CJS/UMD interop wrapping.
    #[serde(rename = "needsInterop")]
    pub needs_interop: bool,
}

/// The persisted optimizer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepMetadata {
    /// Main hash over lockfile + config subset; gates re-bundling.
    pub hash: String,
    /// Short hash that also covers the dep set; invalidates browser-side
    /// URLs without invalidating disk artifacts.
    #[serde(rename = "browserHash")]
    pub browser_hash: String,
    /// Raw dep id → bundle record.
    pub optimized: BTreeMap<String, OptimizedDep>,
}

impl DepMetadata {
    /// Load from a cache directory; any unreadable or unparsable file reads
    /// as absent.
    pub fn load(cache_dir: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(cache_dir.join(METADATA_FILE)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                debug!(%err, "discarding unreadable dep metadata");
                None
            }
        }
    }

    /// Persist as pretty JSON.
    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(cache_dir.join(METADATA_FILE), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut optimized = BTreeMap::new();
        optimized.insert(
            "lodash-es".to_string(),
            OptimizedDep {
                file: dir.path().join("lodash-es.js"),
                src: PathBuf::from("/srv/node_modules/lodash-es/lodash.js"),
                needs_interop: false,
            },
        );
        let metadata = DepMetadata {
            hash: "abc".into(),
            browser_hash: "12345678".into(),
            optimized,
        };
        metadata.save(dir.path()).unwrap();

        let loaded = DepMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn test_missing_or_corrupt_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DepMetadata::load(dir.path()).is_none());
        std::fs::write(dir.path().join(METADATA_FILE), "{ not json").unwrap();
        assert!(DepMetadata::load(dir.path()).is_none());
    }

    #[test]
    fn test_wire_field_names() {
        let metadata = DepMetadata {
            hash: "h".into(),
            browser_hash: "b".into(),
            optimized: BTreeMap::new(),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"browserHash\""));
    }
}
