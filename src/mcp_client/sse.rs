//! JSON-RPC over HTTP + SSE transport.
//!
//! Requests are POSTed to `{base}/mcp/request?clientId=…`. The POST only
//! acknowledges receipt; the actual response arrives later on the server's
//! event stream and is matched to the caller by request id through the
//! shared [`SseStreamManager`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::config::TransportSettings;
use super::errors::McpError;
use super::sse_stream::SseStreamManager;
use super::transport::Transport;
use super::types::{ProtocolRequest, ProtocolResponse, ServerDescriptor, TransportKind};

/// Local bookkeeping for one connected SSE server.
#[derive(Debug, Clone)]
struct SseSession {
    client_id: String,
    base_url: String,
    headers: HashMap<String, String>,
}

/// SSE transport backed by one shared stream manager.
pub struct SseTransport {
    settings: TransportSettings,
    http: reqwest::Client,
    streams: Arc<SseStreamManager>,
    sessions: RwLock<HashMap<String, SseSession>>,
}

impl SseTransport {
    pub fn new(settings: TransportSettings) -> Self {
        let http = reqwest::Client::new();
        let streams = Arc::new(SseStreamManager::new(http.clone(), settings.stream_timeout()));
        Self {
            settings,
            http,
            streams,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The stream manager correlating events for every SSE server.
    pub fn stream_manager(&self) -> &Arc<SseStreamManager> {
        &self.streams
    }

    #[cfg(test)]
    async fn client_id(&self, server: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(server)
            .map(|s| s.client_id.clone())
    }

    /// POST the request; any failure cancels every pending slot.
    async fn post_request(
        &self,
        server: &str,
        session: &SseSession,
        request: &ProtocolRequest,
    ) -> Result<(), McpError> {
        let url = format!("{}/mcp/request", session.base_url);
        let mut post = self
            .http
            .post(&url)
            .query(&[("clientId", session.client_id.as_str())])
            .timeout(self.settings.request_timeout())
            .json(request);
        for (key, value) in &session.headers {
            post = post.header(key.as_str(), value.as_str());
        }

        let reason = match post.send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => format!("HTTP {}", response.status()),
            Err(e) => format!("{e}"),
        };

        tracing::error!(server, method = %request.method, id = %request.id, reason = %reason, "request POST failed");
        self.streams.cancel_all();
        Err(McpError::SendFailed {
            server: server.to_string(),
            reason,
        })
    }
}

/// Removes a request's pending slot unless the manager completed it.
///
/// Covers the timeout path and callers that drop `send_request` mid-flight.
struct PendingGuard<'a> {
    streams: &'a SseStreamManager,
    request_id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.streams.remove_pending(self.request_id) {
            tracing::debug!(request_id = %self.request_id, "abandoned pending request removed");
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self, server: &str, descriptor: &ServerDescriptor) -> Result<(), McpError> {
        let base_url = descriptor
            .url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| McpError::InvalidConfig {
                name: server.to_string(),
                reason: "sse transport requires 'url'".into(),
            })?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(server) {
            tracing::warn!(server, "server is already connected");
            return Ok(());
        }

        let session = SseSession {
            client_id: Uuid::new_v4().to_string(),
            base_url: base_url.to_string(),
            headers: descriptor.headers.clone(),
        };
        self.streams
            .start_stream(server, &session.base_url, &session.client_id, &session.headers);

        tracing::info!(server, url = %session.base_url, client_id = %session.client_id, "MCP server connected via SSE");
        sessions.insert(server.to_string(), session);
        Ok(())
    }

    async fn send_request(
        &self,
        server: &str,
        request: &ProtocolRequest,
    ) -> Result<ProtocolResponse, McpError> {
        let session = self
            .sessions
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::NotConnected {
                server: server.to_string(),
            })?;

        let start = Instant::now();
        // Registered before the POST so a fast event cannot be missed.
        let slot = self.streams.register_pending(server, &request.id);
        let mut guard = PendingGuard {
            streams: &self.streams,
            request_id: &request.id,
            armed: true,
        };
        tracing::debug!(server, method = %request.method, id = %request.id, "sending request");

        self.post_request(server, &session, request).await?;

        let remaining = self.settings.request_timeout().saturating_sub(start.elapsed());
        let waited = tokio::time::timeout(remaining, slot).await;
        if waited.is_ok() {
            // The manager already removed the entry it completed.
            guard.armed = false;
        }
        match waited {
            Ok(Ok(outcome)) => {
                if let Ok(response) = &outcome {
                    tracing::info!(
                        server,
                        method = %request.method,
                        id = %response.id,
                        is_error = response.is_error(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "received response"
                    );
                }
                outcome
            }
            Ok(Err(_)) => Err(McpError::RequestCancelled {
                server: server.to_string(),
                request_id: request.id.clone(),
            }),
            Err(_) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                tracing::error!(server, method = %request.method, elapsed_ms, "timed out waiting for event");
                Err(McpError::Timeout {
                    server: server.to_string(),
                    method: request.method.clone(),
                    elapsed_ms,
                })
            }
        }
    }

    async fn disconnect(&self, server: &str) {
        self.streams.stop_stream(server);
        self.streams.cancel_all();
        if self.sessions.write().await.remove(server).is_some() {
            tracing::info!(server, "MCP server disconnected");
        }
    }

    async fn is_connected(&self, server: &str) -> bool {
        self.sessions.read().await.contains_key(server)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
