//! URL helpers shared by the graph and the server.
//!
//! Module URLs are public paths beginning with `/`. Files outside the served
//! root are addressed through the `/@fs/` scheme so they can still
//! participate in the graph (and therefore in hot-update propagation).

use std::path::{Path, PathBuf};

use path_clean::PathClean;

/// Prefix for URLs that address an absolute filesystem path directly.
pub const FS_PREFIX: &str = "/@fs/";

/// Extensions treated as CSS-family requests.
const CSS_EXTENSIONS: &[&str] = &[
    "css", "less", "sass", "scss", "styl", "stylus", "pcss", "postcss",
];

/// Strip query string and hash fragment from a URL.
pub fn clean_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Split a URL into its path and the trailing query/hash suffix.
pub fn split_suffix(url: &str) -> (&str, &str) {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    (&url[..end], &url[end..])
}

/// Remove a single query parameter (bare flag or `key=value`) from a URL.
///
/// Returns the URL unchanged if the parameter is absent. An emptied query
/// string drops its `?` entirely.
pub fn remove_query_param(url: &str, key: &str) -> String {
    let (rest, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let Some(q) = rest.find('?') else {
        return url.to_string();
    };
    let (path, query) = (&rest[..q], &rest[q + 1..]);
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or(pair);
            name != key
        })
        .collect();
    if kept.is_empty() {
        format!("{path}{hash}")
    } else {
        format!("{path}?{}{hash}", kept.join("&"))
    }
}

/// Strip a `t=<ms>` cache-buster parameter.
pub fn strip_timestamp_query(url: &str) -> String {
    remove_query_param(url, "t")
}

/// Strip the `?import` intent marker.
pub fn strip_import_query(url: &str) -> String {
    remove_query_param(url, "import")
}

/// Whether a URL addresses a CSS-family file.
pub fn is_css_url(url: &str) -> bool {
    Path::new(clean_url(url))
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| CSS_EXTENSIONS.contains(&e))
}

/// Convert an absolute filesystem path to an `/@fs/` URL.
pub fn path_to_fs_url(path: &Path) -> String {
    let cleaned = path.to_path_buf().clean();
    format!("{}{}", FS_PREFIX, cleaned.display().to_string().trim_start_matches('/'))
}

/// Convert an `/@fs/` URL back to an absolute filesystem path.
///
/// Returns `None` when the URL does not carry the fs prefix.
pub fn fs_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = clean_url(url).strip_prefix(FS_PREFIX)?;
    Some(PathBuf::from(format!("/{rest}")).clean())
}
