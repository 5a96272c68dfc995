//! Connection registry — owns the lifecycle of every configured server.
//!
//! Provides:
//! - Transport selection per server (stdio or SSE) from its descriptor
//! - Partial-failure tolerant startup of all configured servers
//! - Runtime register/unregister of individual servers
//! - A per-server tool cache filled from `tools/list`
//!
//! The tool cache is a snapshot: reads never trigger a live fetch, and a
//! refresh replaces a server's tools wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use super::config::TransportSettings;
use super::errors::McpError;
use super::protocol::extract_result;
use super::sse::SseTransport;
use super::stdio::StdioTransport;
use super::transport::{next_request_id, Transport};
use super::types::{
    ProtocolRequest, ProtocolResponse, ServerDescriptor, ToolDescriptor, ToolsListResult,
    TransportKind,
};

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// Process-wide owner of server connections and their tool catalogs.
pub struct ConnectionRegistry {
    stdio: Arc<StdioTransport>,
    sse: Arc<SseTransport>,
    /// Every registered server, connected or not.
    descriptors: RwLock<HashMap<String, ServerDescriptor>>,
    /// Transport chosen for each connected server.
    connections: RwLock<HashMap<String, Arc<dyn Transport>>>,
    /// `server → tools` from the last successful `tools/list`.
    tools: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
}

impl ConnectionRegistry {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            stdio: Arc::new(StdioTransport::new(settings)),
            sse: Arc::new(SseTransport::new(settings)),
            descriptors: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
        }
    }

    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Stdio => self.stdio.clone() as Arc<dyn Transport>,
            TransportKind::Sse => self.sse.clone() as Arc<dyn Transport>,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Register and connect every configured server concurrently.
    ///
    /// A failing server is logged and skipped; the rest still start. Returns
    /// the failures so callers can report partial startup.
    pub async fn initialize(
        &self,
        servers: &HashMap<String, ServerDescriptor>,
    ) -> Vec<(String, McpError)> {
        let attempts = servers.iter().map(|(name, descriptor)| async move {
            let outcome = self.register_server(name, descriptor.clone()).await;
            (name.clone(), outcome)
        });

        let errors: Vec<(String, McpError)> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|e| (name, e)))
            .collect();

        let connected = self.connections.read().await.len();
        tracing::info!(
            configured = servers.len(),
            connected,
            failed = errors.len(),
            "MCP registry initialized"
        );
        errors
    }

    /// Connect one server and populate its tool cache.
    ///
    /// A connect failure leaves the server registered but absent from the
    /// connection map. A failed `tools/list` is only logged: the server stays
    /// connected with an empty tool cache.
    pub async fn register_server(
        &self,
        name: &str,
        descriptor: ServerDescriptor,
    ) -> Result<(), McpError> {
        let kind = descriptor.transport_kind(name);
        self.descriptors
            .write()
            .await
            .insert(name.to_string(), descriptor.clone());

        if self.connections.read().await.contains_key(name) {
            tracing::warn!(server = name, "server already connected, refreshing tools only");
        } else {
            let transport = self.transport_for(kind);
            if let Err(e) = transport.connect(name, &descriptor).await {
                tracing::error!(server = name, transport = %kind, error = %e, "failed to connect MCP server");
                return Err(e);
            }
            self.connections
                .write()
                .await
                .insert(name.to_string(), transport);
        }

        match self.refresh_tools(name).await {
            Ok(count) => {
                tracing::info!(server = name, transport = %kind, tools = count, "MCP server registered");
            }
            Err(e) => {
                tracing::warn!(server = name, error = %e, "tools/list failed, tool cache left empty");
                self.tools.write().await.entry(name.to_string()).or_default();
            }
        }
        Ok(())
    }

    /// Disconnect a server and forget its descriptor and tools.
    pub async fn unregister_server(&self, name: &str) {
        let connection = self.connections.write().await.remove(name);
        if let Some(transport) = connection {
            transport.disconnect(name).await;
        }
        self.tools.write().await.remove(name);
        if self.descriptors.write().await.remove(name).is_some() {
            tracing::info!(server = name, "MCP server unregistered");
        }
    }

    /// Disconnect every server, best effort.
    pub async fn shutdown(&self) {
        let connections: Vec<(String, Arc<dyn Transport>)> =
            self.connections.write().await.drain().collect();
        let count = connections.len();

        join_all(
            connections
                .iter()
                .map(|(name, transport)| transport.disconnect(name)),
        )
        .await;

        self.tools.write().await.clear();
        tracing::info!(disconnected = count, "MCP registry shut down");
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Transport handling `name`, or `None` if it is not connected.
    pub async fn get_connection(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.connections.read().await.get(name).cloned()
    }

    /// Send one request to a connected server.
    pub async fn send_request(
        &self,
        name: &str,
        request: &ProtocolRequest,
    ) -> Result<ProtocolResponse, McpError> {
        let transport = self
            .get_connection(name)
            .await
            .ok_or_else(|| McpError::NotConnected {
                server: name.to_string(),
            })?;
        transport.send_request(name, request).await
    }

    /// Re-fetch a server's tools and overwrite its cache entry.
    pub async fn refresh_tools(&self, name: &str) -> Result<usize, McpError> {
        let request = ProtocolRequest::new(
            next_request_id("tools-list"),
            "tools/list",
            Some(serde_json::json!({})),
        );
        let response = self.send_request(name, &request).await?;
        let result = extract_result(response)?;

        let list: ToolsListResult =
            serde_json::from_value(result).map_err(|e| McpError::MalformedResponse {
                server: name.to_string(),
                reason: format!("failed to parse tools/list result: {e}"),
            })?;

        let count = list.tools.len();
        self.tools.write().await.insert(name.to_string(), list.tools);
        tracing::debug!(server = name, tools = count, "tool cache updated");
        Ok(count)
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Cached tools for a server; empty if unknown or never fetched.
    pub async fn get_tools(&self, name: &str) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Cached tools for every server that has a cache entry.
    pub async fn get_all_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        self.tools.read().await.clone()
    }

    /// Names of every registered server, sorted.
    pub async fn registered_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of every connected server, sorted.
    pub async fn connected_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.descriptors.read().await.contains_key(name)
    }

    pub async fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.descriptors.read().await.get(name).cloned()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
