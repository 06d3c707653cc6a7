//! Source-map seams.
//!
//! Real map composition is an external collaborator's job; the core only
//! needs two things: a single place where a transform chain's maps collapse
//! to one, and the sourcesContent backfill the pipeline performs before
//! caching.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Collapse the maps produced by a transform chain.
///
/// Composition proper is delegated to the embedder's source-map tooling;
/// this seam keeps the last (outermost) map so positions at least refer to
/// the final code.
pub fn combine_sourcemaps(maps: Vec<String>) -> Option<String> {
    maps.into_iter().last()
}

/// Fill `sourcesContent` from disk when a map has mappings but no embedded
/// sources.
///
/// Best-effort: any parse or read problem returns the map unchanged.
pub async fn fill_sources_content(map: String, file: Option<&Path>) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(&map) else {
        return map;
    };
    let has_mappings = value
        .get("mappings")
        .and_then(|m| m.as_str())
        .is_some_and(|m| !m.is_empty());
    let missing_content = match value.get("sourcesContent") {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    };
    if !has_mappings || !missing_content {
        return map;
    }

    let sources = value
        .get("sources")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();
    let base = file.and_then(|f| f.parent());

    let mut contents = Vec::with_capacity(sources.len());
    for source in &sources {
        let content = match source.as_str() {
            Some(rel) if !rel.is_empty() => {
                let path = if Path::new(rel).is_absolute() {
                    Path::new(rel).to_path_buf()
                } else if let Some(base) = base {
                    base.join(rel)
                } else {
                    Path::new(rel).to_path_buf()
                };
                tokio::fs::read_to_string(&path).await.ok()
            }
            _ => None,
        };
        contents.push(content.map(Value::String).unwrap_or(Value::Null));
    }
    if contents.iter().all(Value::is_null) {
        debug!("no sourcesContent could be read from disk");
        return map;
    }
    value["sourcesContent"] = Value::Array(contents);
    serde_json::to_string(&value).unwrap_or(map)
}
