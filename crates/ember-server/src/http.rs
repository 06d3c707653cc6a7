//! HTTP surface of the transform pipeline.
//!
//! One router: the embedded client runtime, a ping endpoint for the
//! client's reconnect loop, and a fallback transform handler implementing
//! the etag / `?direct` / `?t=` contract. Everything else (static files,
//! HTML serving, proxies) belongs to the embedder's middleware chain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use ember_graph::url::{is_css_url, strip_import_query, strip_timestamp_query};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::{ServerError, TransformError};
use crate::transform::{lookup_source_map, transform_request, TransformOptions};
use crate::ws::{ErrorPayload, HmrPayload};

/// URL of the embedded browser client.
pub const CLIENT_PATH: &str = "/@ember/client";
/// Ping endpoint the client polls while the server is down.
pub const PING_PATH: &str = "/__ember_ping";

/// How long a transform request waits on a pending pre-bundle reload.
const PENDING_RELOAD_TIMEOUT: Duration = Duration::from_secs(1);

const CLIENT_SOURCE: &str = include_str!("../client/ember-client.js");

/// Build the serving router around a context.
pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route(CLIENT_PATH, get(handle_client))
        .route(PING_PATH, get(handle_ping))
        .fallback(handle_transform)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx)
}

/// Bind and serve until the process is torn down.
pub async fn serve(ctx: Arc<ServerContext>, addr: SocketAddr) -> Result<(), ServerError> {
    ctx.container.config_resolved(&ctx.config).await?;
    ctx.container.build_start().await?;

    let app = build_router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("dev server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Substitute the injected build-time constants into the client source.
pub fn render_client(config: &ServerConfig) -> String {
    let hmr = &config.hmr;
    let json_or_null =
        |v: Option<&str>| v.map(|s| format!("{s:?}")).unwrap_or_else(|| "null".into());
    CLIENT_SOURCE
        .replace("__BASE__", "'/'")
        .replace("__HMR_PROTOCOL__", &json_or_null(hmr.protocol.as_deref()))
        .replace("__HMR_HOSTNAME__", &json_or_null(hmr.host.as_deref()))
        .replace(
            "__HMR_PORT__",
            &hmr.port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "null".into()),
        )
        .replace("__HMR_TIMEOUT__", &hmr.timeout_ms.to_string())
        .replace(
            "__HMR_ENABLE_OVERLAY__",
            if hmr.overlay { "true" } else { "false" },
        )
}

async fn handle_client(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(render_client(&ctx.config)))
        .unwrap()
}

async fn handle_ping() -> &'static str {
    "pong"
}

fn has_query_flag(query: &str, flag: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair == flag || pair.starts_with(&format!("{flag}=")))
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body.into()))
        .unwrap()
}

async fn handle_transform(
    State(ctx): State<Arc<ServerContext>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();

    // HTML and the root are the embedder's concern
    if path == "/" || path.ends_with(".html") {
        return plain(StatusCode::NOT_FOUND, format!("not served here: {path}"));
    }

    // hold requests while a runtime-discovered dep re-bundles
    if ctx
        .wait_pending_reload(PENDING_RELOAD_TIMEOUT)
        .await
        .is_err()
    {
        return Response::builder()
            .status(StatusCode::REQUEST_TIMEOUT)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(
                "<h1>408 Request Timeout</h1>\
                 <p>A newly discovered dependency is being pre-bundled. \
                 Reload the page once bundling finishes.</p>",
            ))
            .unwrap();
    }

    // source-map siblings come from the module's cached map
    if path.ends_with(".map") {
        return match lookup_source_map(&ctx, &path).await {
            Some(map) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(map))
                .unwrap(),
            None => plain(StatusCode::NOT_FOUND, format!("no source map for {path}")),
        };
    }

    let raw_url = if query.is_empty() {
        path.clone()
    } else {
        format!("{path}?{query}")
    };
    let url = strip_import_query(&strip_timestamp_query(&raw_url));
    let as_stylesheet = is_css_url(&url) && has_query_flag(&query, "direct");

    match transform_request(&ctx, &url, TransformOptions::default()).await {
        Ok(Some(result)) => {
            if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
                if if_none_match.to_str().ok() == Some(result.etag.as_str()) {
                    return Response::builder()
                        .status(StatusCode::NOT_MODIFIED)
                        .header(header::ETAG, result.etag.as_str())
                        .body(Body::empty())
                        .unwrap();
                }
            }
            let content_type = if as_stylesheet {
                "text/css"
            } else {
                "application/javascript"
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ETAG, result.etag.as_str())
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from(result.code.clone()))
                .unwrap()
        }
        Ok(None) => plain(StatusCode::NOT_FOUND, format!("module not found: {url}")),
        Err(err) => {
            error!(%url, %err, "transform failed");
            let payload = HmrPayload::Error {
                err: error_payload(&url, &err),
            };
            ctx.broadcast(&payload).await;
            plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_payload(url: &str, err: &TransformError) -> ErrorPayload {
    let plugin = match err {
        TransformError::Plugin { plugin, .. } => Some(plugin.clone()),
        _ => None,
    };
    ErrorPayload {
        message: err.to_string(),
        stack: String::new(),
        id: Some(url.to_string()),
        frame: None,
        loc: None,
        plugin,
    }
}
