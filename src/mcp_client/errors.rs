//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The server descriptor is missing a field its transport needs.
    #[error("invalid config for server '{name}': {reason}")]
    InvalidConfig {
        name: String,
        reason: String,
    },

    /// No live connection exists for the server.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// No response arrived within the request deadline.
    #[error("request '{method}' to server '{server}' timed out after {elapsed_ms}ms")]
    Timeout {
        server: String,
        method: String,
        elapsed_ms: u64,
    },

    /// The peer closed its output before a JSON line arrived.
    #[error("no response from server '{server}' for '{method}' (stream closed after {attempts} noise lines)")]
    NoResponse {
        server: String,
        method: String,
        attempts: u32,
    },

    /// The peer kept printing non-JSON lines past the attempt budget.
    #[error("server '{server}' sent {attempts} non-JSON lines without answering '{method}'")]
    TooManyNoisyLines {
        server: String,
        method: String,
        attempts: u32,
    },

    /// A JSON line or event did not have the JSON-RPC response shape.
    #[error("malformed response from server '{server}': {reason}")]
    MalformedResponse {
        server: String,
        reason: String,
    },

    /// The HTTP POST carrying a request was rejected or never reached the server.
    #[error("failed to send request to server '{server}': {reason}")]
    SendFailed {
        server: String,
        reason: String,
    },

    /// Pipe I/O error (write, flush, or read failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// A pending SSE request was cancelled by teardown before its event arrived.
    #[error("request '{request_id}' to server '{server}' was cancelled")]
    RequestCancelled {
        server: String,
        request_id: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Configuration error (unreadable or unparsable config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this failure was a deadline expiry.
    ///
    /// Timeouts are reported distinctly so callers can apply a different
    /// backoff policy than for hard failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// The server this error relates to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            McpError::SpawnFailed { name, .. } | McpError::InvalidConfig { name, .. } => {
                Some(name)
            }
            McpError::NotConnected { server }
            | McpError::Timeout { server, .. }
            | McpError::NoResponse { server, .. }
            | McpError::TooManyNoisyLines { server, .. }
            | McpError::MalformedResponse { server, .. }
            | McpError::SendFailed { server, .. }
            | McpError::TransportError { server, .. }
            | McpError::RequestCancelled { server, .. } => Some(server),
            McpError::ServerError { .. } | McpError::ConfigError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout() {
        let err = McpError::Timeout {
            server: "fs".into(),
            method: "tools/list".into(),
            elapsed_ms: 25_000,
        };
        assert!(err.is_timeout());
        assert!(!McpError::NotConnected { server: "fs".into() }.is_timeout());
    }

    #[test]
    fn test_server_accessor() {
        let err = McpError::SpawnFailed {
            name: "ocr".into(),
            reason: "not found".into(),
        };
        assert_eq!(err.server(), Some("ocr"));

        let err = McpError::ConfigError {
            reason: "bad yaml".into(),
        };
        assert_eq!(err.server(), None);
    }

    #[test]
    fn test_timeout_message_includes_context() {
        let err = McpError::Timeout {
            server: "weather".into(),
            method: "tools/call".into(),
            elapsed_ms: 25_013,
        };
        let msg = err.to_string();
        assert!(msg.contains("weather"));
        assert!(msg.contains("tools/call"));
        assert!(msg.contains("25013ms"));
    }
}
