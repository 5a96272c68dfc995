//! Wire codec shared by both transports.
//!
//! - Classifying stdout lines as JSON or noise
//! - Encoding requests as single `\n`-terminated lines
//! - Decoding responses that arrive as a bare object or a one-element array

use super::errors::McpError;
use super::types::{ProtocolRequest, ProtocolResponse, ResponsePayload, WireResponse};

/// Whether a line should be treated as a protocol message rather than noise.
///
/// Only the first non-whitespace character is inspected; anything that does
/// not open an object or array is banner/log text.
pub fn looks_like_json(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// Serialize a request as one newline-terminated line.
pub fn encode_request_line(server: &str, request: &ProtocolRequest) -> Result<String, McpError> {
    let mut line = serde_json::to_string(request).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize request: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

/// Parse one line of peer output into a response.
pub fn parse_response_line(server: &str, line: &str) -> Result<ProtocolResponse, McpError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).map_err(|e| McpError::MalformedResponse {
            server: server.to_string(),
            reason: format!("invalid JSON: {e}"),
        })?;
    parse_response_value(server, value)
}

/// Convert a parsed JSON value into a response.
///
/// Some peers wrap single responses in an array; in that case the first
/// element is used and the rest are discarded.
pub fn parse_response_value(
    server: &str,
    value: serde_json::Value,
) -> Result<ProtocolResponse, McpError> {
    let malformed = |reason: String| McpError::MalformedResponse {
        server: server.to_string(),
        reason,
    };

    let object = match value {
        serde_json::Value::Array(items) => {
            let len = items.len();
            let first = items
                .into_iter()
                .next()
                .ok_or_else(|| malformed("empty array response".into()))?;
            if len > 1 {
                tracing::debug!(server, discarded = len - 1, "array response, using first element");
            }
            first
        }
        other => other,
    };

    if !object.is_object() {
        return Err(malformed(format!("expected a JSON object, got {object}")));
    }

    let wire: WireResponse = serde_json::from_value(object)
        .map_err(|e| malformed(format!("not a JSON-RPC response: {e}")))?;

    let payload = match (wire.result, wire.error) {
        (Some(result), None) => ResponsePayload::Result(result),
        // A null result next to an error is read as the error.
        (Some(serde_json::Value::Null), Some(error)) => ResponsePayload::Error(error),
        (None, Some(error)) => ResponsePayload::Error(error),
        (Some(_), Some(_)) => return Err(malformed("both 'result' and 'error' present".into())),
        (None, None) => return Err(malformed("neither 'result' nor 'error' present".into())),
    };

    Ok(ProtocolResponse {
        jsonrpc: wire.jsonrpc.unwrap_or_else(|| super::types::JSONRPC_VERSION.to_string()),
        id: wire.id.as_ref().and_then(id_to_string).unwrap_or_default(),
        payload,
    })
}

/// Render a JSON-RPC id as text. Numeric ids are accepted from lenient peers.
pub fn id_to_string(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the result from a response, converting errors to `McpError`.
pub fn extract_result(response: ProtocolResponse) -> Result<serde_json::Value, McpError> {
    match response.payload {
        ResponsePayload::Result(value) => Ok(value),
        ResponsePayload::Error(err) => Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_json() {
        assert!(looks_like_json(r#"{"jsonrpc":"2.0"}"#));
        assert!(looks_like_json("  [1]"));
        assert!(!looks_like_json("Server listening on stdio"));
        assert!(!looks_like_json(""));
        assert!(!looks_like_json("   "));
    }

    #[test]
    fn test_encode_request_line_is_single_line() {
        let req = ProtocolRequest::new(
            "1",
            "tools/call",
            Some(serde_json::json!({"text": "line one\nline two"})),
        );
        let line = encode_request_line("fs", &req).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_parse_bare_object() {
        let resp =
            parse_response_line("fs", r#"{"jsonrpc":"2.0","id":"7","result":{"ok":true}}"#)
                .unwrap();
        assert_eq!(resp.id, "7");
        assert_eq!(resp.result().unwrap()["ok"], true);
    }

    #[test]
    fn test_array_wrapped_equals_bare() {
        let bare =
            parse_response_line("fs", r#"{"jsonrpc":"2.0","id":"7","result":{"n":1}}"#).unwrap();
        let wrapped = parse_response_line(
            "fs",
            r#"[{"jsonrpc":"2.0","id":"7","result":{"n":1}},{"jsonrpc":"2.0","id":"8","result":2}]"#,
        )
        .unwrap();
        assert_eq!(bare, wrapped);
    }

    #[test]
    fn test_empty_array_is_malformed() {
        let err = parse_response_line("fs", "[]").unwrap_err();
        assert!(matches!(err, McpError::MalformedResponse { .. }));
    }

    #[test]
    fn test_both_members_is_malformed() {
        let err = parse_response_line(
            "fs",
            r#"{"jsonrpc":"2.0","id":"1","result":1,"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_neither_member_is_malformed() {
        let err = parse_response_line("fs", r#"{"jsonrpc":"2.0","id":"1"}"#).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn test_null_result_with_error_is_error_response() {
        let resp = parse_response_line(
            "fs",
            r#"{"jsonrpc":"2.0","id":"2","result":null,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(resp.error().unwrap().code, -32601);
    }

    #[test]
    fn test_null_result_is_success() {
        let resp = parse_response_line("fs", r#"{"jsonrpc":"2.0","id":"3","result":null}"#).unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.result(), Some(&serde_json::Value::Null));
    }

    #[test]
    fn test_null_success_survives_serialization() {
        let original = ProtocolResponse::success("4", serde_json::Value::Null);
        let line = serde_json::to_string(&original).unwrap();
        assert_eq!(parse_response_line("fs", &line).unwrap(), original);
    }

    #[test]
    fn test_numeric_id_is_rendered_as_text() {
        let resp = parse_response_line("fs", r#"{"jsonrpc":"2.0","id":12,"result":[]}"#).unwrap();
        assert_eq!(resp.id, "12");
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = parse_response_line("fs", "{not json").unwrap_err();
        assert!(matches!(err, McpError::MalformedResponse { .. }));
    }

    #[test]
    fn test_extract_result_error() {
        let resp = ProtocolResponse::failure("1", -32601, "Method not found");
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }
}
