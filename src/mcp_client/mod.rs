//! MCP Client — JSON-RPC transports and connection lifecycle for MCP servers.
//!
//! This module handles:
//! - JSON-RPC 2.0 message model and wire codec
//! - Stdio transport: child processes speaking line-delimited JSON
//! - SSE transport: HTTP POST requests answered over an event stream
//! - Connection registry: per-server transport selection, startup, tool cache
//! - Tool invocation with explicit per-call context
//!
//! Callers obtain a server's transport from the [`ConnectionRegistry`] and
//! send requests through it without caring which channel it uses.

pub mod config;
pub mod errors;
pub mod invoke;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod sse_stream;
pub mod stdio;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{load_config, load_or_default, TransportSettings};
pub use errors::McpError;
pub use invoke::{call_tool, CallContext};
pub use registry::ConnectionRegistry;
pub use sse::SseTransport;
pub use sse_stream::SseStreamManager;
pub use stdio::{ConnectionState, StdioTransport};
pub use transport::{next_request_id, Transport};
pub use types::{
    McpServersConfig, ProtocolError, ProtocolRequest, ProtocolResponse, ServerDescriptor,
    ToolCallResult, ToolDescriptor, TransportKind,
};
