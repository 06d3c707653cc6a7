//! # ember-graph
//!
//! Module graph foundation for the ember dev server.
//!
//! Maintains a directed multigraph of served modules under concurrent reads
//! (HTTP requests) and writes (file-system events, import-graph refreshes).
//! Nodes are indexed three ways:
//!
//! - by public URL,
//! - by plugin-resolved id,
//! - by backing file (one file may back several URL variants via query
//!   parameters such as `?direct`).
//!
//! The crate is deliberately free of I/O and plugin logic; resolution is
//! injected through [`UrlResolver`] so the serving layer can plug in its
//! plugin container.

pub mod graph;
pub mod node;
pub mod url;

pub use graph::{
    GraphError, IdentityResolver, ModuleGraph, ResolvedId, ResolvedUrl, Result, UrlResolver,
};
pub use node::{weak_etag, ModuleKind, ModuleNode, TransformResult};
pub use url::FS_PREFIX;
