//! Transport contract shared by the stdio and SSE implementations.
//!
//! A transport owns the connections for every server it was asked to
//! connect, keyed by server name. The registry picks one transport per
//! server at connect time and routes all later calls through it.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::errors::McpError;
use super::types::{ProtocolRequest, ProtocolResponse, ServerDescriptor, TransportKind};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique request id such as `tools-list-17`.
pub fn next_request_id(prefix: &str) -> String {
    let n = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Uniform connect/send/disconnect contract over one channel type.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which channel type this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Establish a connection for `server`.
    ///
    /// Connecting a server that already has a connection is a no-op that
    /// logs a warning.
    async fn connect(&self, server: &str, descriptor: &ServerDescriptor) -> Result<(), McpError>;

    /// Send one request and wait for its response.
    async fn send_request(
        &self,
        server: &str,
        request: &ProtocolRequest,
    ) -> Result<ProtocolResponse, McpError>;

    /// Tear down the connection for `server`. Idempotent, never fails.
    async fn disconnect(&self, server: &str);

    /// Whether `server` currently has a usable connection.
    async fn is_connected(&self, server: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_request_id_is_unique() {
        let a = next_request_id("tools-list");
        let b = next_request_id("tools-list");
        assert_ne!(a, b);
        assert!(a.starts_with("tools-list-"));
    }
}
