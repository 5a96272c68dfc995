//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP tool descriptors, and per-server
//! configuration.

use std::collections::HashMap;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use super::config::TransportSettings;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC protocol version carried on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message.
///
/// The `id` is chosen by the caller and must be unique among requests in
/// flight to the same server; SSE responses are correlated on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: String,
}

impl ProtocolRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<String>, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: id.into(),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Outcome carried by a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(serde_json::Value),
    Error(ProtocolError),
}

/// JSON-RPC 2.0 response message.
///
/// Built only through [`super::protocol::parse_response_value`] (or the
/// constructors below), so the result/error exclusivity always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolResponse {
    pub jsonrpc: String,
    pub id: String,
    pub payload: ResponsePayload,
}

impl ProtocolResponse {
    /// A successful response.
    pub fn success(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            payload: ResponsePayload::Result(result),
        }
    }

    /// An error response.
    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            payload: ResponsePayload::Error(ProtocolError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The `result` member, if this is a success response.
    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    /// The `error` member, if this is an error response.
    pub fn error(&self) -> Option<&ProtocolError> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(err) => Some(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }
}

impl Serialize for ProtocolResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ProtocolResponse", 3)?;
        state.serialize_field("jsonrpc", &self.jsonrpc)?;
        state.serialize_field("id", &self.id)?;
        match &self.payload {
            ResponsePayload::Result(value) => state.serialize_field("result", value)?,
            ResponsePayload::Error(err) => state.serialize_field("error", err)?,
        }
        state.end()
    }
}

/// Loose wire shape of a response before the exclusivity check.
#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// `Some(Value::Null)` when the member is present as `null`.
    #[serde(default, deserialize_with = "present_value")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ProtocolError>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema", rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub server: String,
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// Which transport a server is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Sse => f.write_str("sse"),
        }
    }
}

/// Static configuration for one server, keyed by name in [`McpServersConfig`].
///
/// Stdio servers use `command`/`args`/`cwd`/`env`; SSE servers use
/// `url`/`headers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// `"stdio"` (default) or `"sse"`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

impl ServerDescriptor {
    /// A stdio descriptor running `command` with `args`.
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        Self {
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// An SSE descriptor rooted at `url`.
    pub fn sse(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            transport: Some("sse".to_string()),
            ..Self::default()
        }
    }

    /// Resolve the declared transport type.
    ///
    /// Absent or `"stdio"` selects stdio, `"sse"` selects SSE. Anything else
    /// falls back to stdio with a warning.
    pub fn transport_kind(&self, server_name: &str) -> TransportKind {
        match self.transport.as_deref().map(str::trim) {
            None | Some("") => TransportKind::Stdio,
            Some(t) if t.eq_ignore_ascii_case("stdio") => TransportKind::Stdio,
            Some(t) if t.eq_ignore_ascii_case("sse") => TransportKind::Sse,
            Some(other) => {
                tracing::warn!(
                    server = server_name,
                    transport = other,
                    "unknown transport type, falling back to stdio"
                );
                TransportKind::Stdio
            }
        }
    }
}

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,
    #[serde(default)]
    pub settings: TransportSettings,
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Short name of a reserved code, if it is one.
    pub fn describe(code: i64) -> Option<&'static str> {
        match code {
            PARSE_ERROR => Some("parse error"),
            INVALID_REQUEST => Some("invalid request"),
            METHOD_NOT_FOUND => Some("method not found"),
            INVALID_PARAMS => Some("invalid params"),
            INTERNAL_ERROR => Some("internal error"),
            -32099..=-32000 => Some("server error"),
            _ => None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
