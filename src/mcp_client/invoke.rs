//! Tool invocation with explicit per-call context.
//!
//! The access token and session id travel as a [`CallContext`] argument
//! from the caller down to the request; nothing is read from ambient state.

use std::time::Instant;

use super::errors::McpError;
use super::protocol::extract_result;
use super::registry::ConnectionRegistry;
use super::transport::next_request_id;
use super::types::{error_codes, ProtocolRequest, ToolCallResult};

/// Argument key the access token is injected under.
pub const ACCESS_TOKEN_ARG: &str = "access_token";

/// Per-call data supplied by the layer issuing the tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub access_token: Option<String>,
    pub session_id: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Merge context into tool arguments.
///
/// The access token is added only when the arguments do not already carry
/// one. `null` arguments become an object; non-object arguments pass
/// through untouched.
pub fn prepare_arguments(ctx: &CallContext, arguments: serde_json::Value) -> serde_json::Value {
    let mut map = match arguments {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => return other,
    };

    if let Some(token) = &ctx.access_token {
        map.entry(ACCESS_TOKEN_ARG)
            .or_insert_with(|| serde_json::Value::String(token.clone()));
    }
    serde_json::Value::Object(map)
}

/// Execute a tool on a connected server.
///
/// Steps:
/// 1. Resolve the server's transport from the registry
/// 2. Send a `tools/call` request with a fresh id
/// 3. Map the response into a [`ToolCallResult`]
///
/// A JSON-RPC error response is a completed call with `success = false`;
/// transport failures are returned as `Err`.
pub async fn call_tool(
    registry: &ConnectionRegistry,
    ctx: &CallContext,
    server: &str,
    tool: &str,
    arguments: serde_json::Value,
) -> Result<ToolCallResult, McpError> {
    let transport = registry
        .get_connection(server)
        .await
        .ok_or_else(|| McpError::NotConnected {
            server: server.to_string(),
        })?;

    let params = serde_json::json!({
        "name": tool,
        "arguments": prepare_arguments(ctx, arguments),
    });
    let request = ProtocolRequest::new(next_request_id("tools-call"), "tools/call", Some(params));

    tracing::info!(
        server,
        tool,
        id = %request.id,
        session_id = ctx.session_id.as_deref().unwrap_or("-"),
        "calling tool"
    );

    let start = Instant::now();
    let response = transport.send_request(server, &request).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    match extract_result(response) {
        Ok(result) => Ok(ToolCallResult {
            server: server.to_string(),
            tool_name: tool.to_string(),
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: elapsed,
        }),
        Err(McpError::ServerError { code, message, .. }) => {
            tracing::warn!(server, tool, code, message = %message, "tool returned an error");
            Ok(ToolCallResult {
                server: server.to_string(),
                tool_name: tool.to_string(),
                success: false,
                result: None,
                error: Some(tool_error_text(code, &message)),
                execution_time_ms: elapsed,
            })
        }
        Err(e) => Err(e),
    }
}

/// `[code name] message` for reserved codes, `[code] message` otherwise.
fn tool_error_text(code: i64, message: &str) -> String {
    match error_codes::describe(code) {
        Some(name) => format!("[{code} {name}] {message}"),
        None => format!("[{code}] {message}"),
    }
}
