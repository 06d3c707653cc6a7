//! HMR wire payloads and the connected-client registry.
//!
//! The server serializes [`HmrPayload`] values to JSON and pushes them into
//! per-client channels; the embedder's WebSocket layer drains those channels
//! onto real sockets using the `ember-hmr` subprotocol. Client→server
//! traffic is free-form `"ping"` text frames and never reaches this module.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// WebSocket subprotocol the browser client requests.
pub const HMR_SUBPROTOCOL: &str = "ember-hmr";

/// Server→client payload union, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    /// Handshake acknowledgement; no body.
    Connected,
    /// One batch of hot updates.
    Update { updates: Vec<Update> },
    /// Ask the page to reload; `path` scopes HTML-file reloads.
    FullReload {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Modules no longer imported by anything; run their cleanup hooks.
    Prune { paths: Vec<String> },
    /// Plugin-defined event.
    Custom {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Error for the browser overlay.
    Error { err: ErrorPayload },
}

/// A single update entry inside an `update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub timestamp: u64,
    /// URL of the boundary module that will re-import.
    pub path: String,
    /// URL whose change is being accepted at that boundary.
    #[serde(rename = "acceptedPath")]
    pub accepted_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    JsUpdate,
    CssUpdate,
}

/// Error body rendered by the browser overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub stack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<ErrorLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Tracks connected HMR clients and broadcasts serialized payloads.
///
/// Channels that reject a send are treated as disconnected and dropped after
/// the broadcast pass.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<FxHashMap<usize, mpsc::Sender<String>>>,
    next_id: AtomicUsize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; returns its id and the channel the socket layer
    /// drains.
    pub fn register(&self) -> (usize, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.clients.write().insert(id, tx);
        debug!(id, "hmr client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: usize) {
        self.clients.write().remove(&id);
        debug!(id, "hmr client disconnected");
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    /// Serialize and push a payload to every connected client.
    pub async fn broadcast(&self, payload: &HmrPayload) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to serialize hmr payload");
                return;
            }
        };
        let clients: Vec<(usize, mpsc::Sender<String>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in clients {
            if tx.send(json.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_shape() {
        let payload = HmrPayload::Update {
            updates: vec![Update {
                kind: UpdateKind::JsUpdate,
                timestamp: 100,
                path: "/A".into(),
                accepted_path: "/B".into(),
            }],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"update""#));
        assert!(json.contains(r#""type":"js-update""#));
        assert!(json.contains(r#""acceptedPath":"/B""#));
        assert!(json.contains(r#""path":"/A""#));
    }

    #[test]
    fn test_full_reload_omits_empty_path() {
        let json = serde_json::to_string(&HmrPayload::FullReload { path: None }).unwrap();
        assert_eq!(json, r#"{"type":"full-reload"}"#);

        let json = serde_json::to_string(&HmrPayload::FullReload {
            path: Some("/index.html".into()),
        })
        .unwrap();
        assert!(json.contains(r#""path":"/index.html""#));
    }

    #[test]
    fn test_connected_payload() {
        assert_eq!(
            serde_json::to_string(&HmrPayload::Connected).unwrap(),
            r#"{"type":"connected"}"#
        );
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dead_clients() {
        let registry = ClientRegistry::new();
        let (_id1, mut rx1) = registry.register();
        let (_id2, rx2) = registry.register();
        drop(rx2);

        registry
            .broadcast(&HmrPayload::FullReload { path: None })
            .await;

        assert_eq!(rx1.recv().await.unwrap(), r#"{"type":"full-reload"}"#);
        assert_eq!(registry.count(), 1);
    }
}
