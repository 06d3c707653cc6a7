//! # ember-server
//!
//! Serving core of the ember dev server: the plugin-driven transform
//! pipeline, the HMR propagation engine, and the browser client runtime,
//! built on the module graph from `ember-graph`.
//!
//! ## Overview
//!
//! - [`plugins`]: the hook contract and the container that drives
//!   resolve → load → transform across an ordered plugin list.
//! - [`transform`]: per-URL cached, request-deduplicated transforms with
//!   weak etags.
//! - [`hmr`]: invalidation and boundary walks over the importer graph,
//!   full-reload fallbacks, prune signals.
//! - [`accept_lexer`]: extraction of hot-accept dep literals without a
//!   JavaScript parse.
//! - [`ws`]: HMR wire payloads and the connected-client registry.
//! - [`http`]: the transform endpoint, the embedded client route, and the
//!   ping endpoint.
//! - [`watcher`]: the `notify`-backed event stream the propagator
//!   consumes.
//!
//! Everything hangs off one [`ServerContext`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_server::{ServerConfig, ServerContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new("/srv/app");
//! let ctx = ServerContext::new(config, vec![]);
//! ember_server::http::serve(Arc::clone(&ctx), "127.0.0.1:3000".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod accept_lexer;
pub mod builtins;
pub mod config;
pub mod context;
pub mod error;
pub mod hmr;
pub mod http;
pub mod lexer;
pub mod logging;
pub mod plugins;
pub mod sourcemap;
pub mod transform;
pub mod watcher;
pub mod ws;

pub use accept_lexer::{lex_accepted_deps, AcceptedDep, AcceptedDeps};
pub use config::{HmrConfig, OptimizeDepsConfig, ServerConfig};
pub use context::ServerContext;
pub use error::{LexError, PendingReloadTimeout, Result, ServerError, TransformError};
pub use hmr::{handle_file_change, HmrOutcome};
pub use logging::{init_logging, init_logging_from_env, LogLevel};
pub use plugins::{
    HotUpdateContext, LoadResult, Plugin, PluginContainer, PluginEnforce, ResolveIdResult,
    TransformHookOutput,
};
pub use transform::{transform_request, TransformOptions};
pub use watcher::{FileChange, FileWatcher};
pub use ws::{ErrorPayload, HmrPayload, Update, UpdateKind, HMR_SUBPROTOCOL};

// re-export the graph foundation for embedders
pub use ember_graph::{ModuleGraph, ModuleKind, ModuleNode, TransformResult};
