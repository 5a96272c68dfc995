//! JSON-RPC over stdio transport.
//!
//! Handles communication with MCP server child processes:
//! - Spawning the process with its args, working directory, and environment
//! - Draining startup banner text printed before any protocol traffic
//! - Writing one request line to stdin and polling stdout for the answer,
//!   skipping non-JSON log lines within a bounded budget
//!
//! Each connection allows one request in flight; concurrent callers for the
//! same server queue on a per-connection lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};

use super::config::TransportSettings;
use super::errors::McpError;
use super::protocol::{encode_request_line, looks_like_json, parse_response_line};
use super::transport::Transport;
use super::types::{ProtocolRequest, ProtocolResponse, ServerDescriptor, TransportKind};

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle of one stdio connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

/// The pipe pair of a running server.
struct StdioChannel {
    writer: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// A spawned server process and its pipes.
struct StdioConnection {
    server: String,
    state: StdMutex<ConnectionState>,
    process: Mutex<Child>,
    /// `None` once the connection is closed. Holding this lock is what
    /// serializes requests to the same server.
    channel: Mutex<Option<StdioChannel>>,
}

impl StdioConnection {
    fn new(server: &str, process: Child, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server: server.to_string(),
            state: StdMutex::new(ConnectionState::Connecting),
            process: Mutex::new(process),
            channel: Mutex::new(Some(StdioChannel {
                writer: stdin,
                lines: BufReader::new(stdout).lines(),
            })),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Skip banner text the server prints on startup.
    ///
    /// Reads at most `init_drain_lines` lines, giving up as soon as no line
    /// arrives within one poll interval. A JSON-looking line ends the drain
    /// and is dropped, not replayed.
    async fn drain_banner(&self, settings: &TransportSettings) {
        let mut guard = self.channel.lock().await;
        let Some(channel) = guard.as_mut() else {
            return;
        };

        for _ in 0..settings.init_drain_lines {
            match tokio::time::timeout(settings.poll_interval(), channel.lines.next_line()).await {
                Err(_) => break,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server, error = %e, "stdout read failed during startup drain");
                    break;
                }
                Ok(Ok(Some(line))) => {
                    if looks_like_json(&line) {
                        tracing::debug!(
                            server = %self.server,
                            line = %line,
                            "JSON line during startup drain, abandoning it"
                        );
                        break;
                    }
                    tracing::debug!(server = %self.server, line = %line, "ignoring startup banner line");
                }
            }
        }
    }

    /// Write one request and poll stdout for the first JSON line.
    async fn request(
        &self,
        request: &ProtocolRequest,
        settings: &TransportSettings,
    ) -> Result<ProtocolResponse, McpError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or_else(|| McpError::NotConnected {
            server: self.server.clone(),
        })?;

        let line = encode_request_line(&self.server, request)?;
        tracing::debug!(server = %self.server, method = %request.method, id = %request.id, "sending request");

        channel
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        channel
            .writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;

        let timeout = settings.request_timeout();
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::error!(
                    server = %self.server,
                    method = %request.method,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "timed out waiting for response"
                );
                return Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: request.method.clone(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            // Bounded wait instead of a blocking read so the deadline is
            // re-checked at every poll interval. `next_line` is cancel safe.
            let wait = settings.poll_interval().min(timeout - elapsed);
            let line = match tokio::time::timeout(wait, channel.lines.next_line()).await {
                Err(_) => continue,
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    tracing::warn!(server = %self.server, attempts, "stdout closed before a response");
                    return Err(McpError::NoResponse {
                        server: self.server.clone(),
                        method: request.method.clone(),
                        attempts,
                    });
                }
                Ok(Err(e)) => {
                    return Err(McpError::TransportError {
                        server: self.server.clone(),
                        reason: format!("failed to read from stdout: {e}"),
                    });
                }
            };

            if !looks_like_json(&line) {
                attempts += 1;
                tracing::debug!(server = %self.server, attempt = attempts, line = %line, "skipping non-JSON line");
                if attempts >= settings.max_noise_lines {
                    tracing::error!(server = %self.server, attempts, "too many non-JSON lines");
                    return Err(McpError::TooManyNoisyLines {
                        server: self.server.clone(),
                        method: request.method.clone(),
                        attempts,
                    });
                }
                continue;
            }

            let response = parse_response_line(&self.server, &line)?;
            tracing::info!(
                server = %self.server,
                method = %request.method,
                id = %response.id,
                is_error = response.is_error(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "received response"
            );
            return Ok(response);
        }
    }

    /// Whether the child process is still running.
    async fn is_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Kill the process and close both pipe ends.
    async fn close(&self) {
        self.set_state(ConnectionState::Closed);

        {
            let mut process = self.process.lock().await;
            if let Err(e) = process.kill().await {
                tracing::debug!(server = %self.server, error = %e, "kill failed (process may have exited)");
            }
        }

        // Waits for any in-flight request, which ends on EOF once the
        // process is gone.
        self.channel.lock().await.take();
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Stdio transport managing one child process per connected server.
pub struct StdioTransport {
    settings: TransportSettings,
    connections: RwLock<HashMap<String, Arc<StdioConnection>>>,
}

impl StdioTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Current lifecycle state for `server`.
    pub async fn state(&self, server: &str) -> ConnectionState {
        self.connections
            .read()
            .await
            .get(server)
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Build the child process command from a descriptor.
    fn build_command(server: &str, descriptor: &ServerDescriptor) -> Result<Command, McpError> {
        let program = descriptor
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| McpError::InvalidConfig {
                name: server.to_string(),
                reason: "stdio transport requires 'command'".into(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(&descriptor.args);
        // Merged on top of the inherited environment.
        cmd.envs(&descriptor.env);

        if let Some(dir) = descriptor.cwd.as_deref().filter(|d| !d.trim().is_empty()) {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }
}

/// Forward a server's stderr to the log, line by line.
fn forward_stderr(server: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, line = %line, "server stderr");
        }
    });
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self, server: &str, descriptor: &ServerDescriptor) -> Result<(), McpError> {
        if self.connections.read().await.contains_key(server) {
            tracing::warn!(server, "server is already connected");
            return Ok(());
        }

        let mut cmd = Self::build_command(server, descriptor)?;
        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: server.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: server.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(server.to_string(), stderr);
        }

        let connection = Arc::new(StdioConnection::new(server, child, stdin, stdout));
        connection.drain_banner(&self.settings).await;
        connection.set_state(ConnectionState::Ready);

        let mut connections = self.connections.write().await;
        if connections.contains_key(server) {
            // Lost a race with a concurrent connect; ours is dropped and killed.
            tracing::warn!(server, "server connected concurrently, discarding duplicate process");
            return Ok(());
        }
        connections.insert(server.to_string(), connection);

        tracing::info!(
            server,
            command = descriptor.command.as_deref().unwrap_or_default(),
            "MCP server connected via stdio"
        );
        Ok(())
    }

    async fn send_request(
        &self,
        server: &str,
        request: &ProtocolRequest,
    ) -> Result<ProtocolResponse, McpError> {
        let connection = self
            .connections
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::NotConnected {
                server: server.to_string(),
            })?;

        if connection.state() != ConnectionState::Ready {
            return Err(McpError::NotConnected {
                server: server.to_string(),
            });
        }

        connection.request(request, &self.settings).await
    }

    async fn disconnect(&self, server: &str) {
        let removed = self.connections.write().await.remove(server);
        if let Some(connection) = removed {
            connection.close().await;
            tracing::info!(server, "MCP server disconnected");
        }
    }

    async fn is_connected(&self, server: &str) -> bool {
        let connection = self.connections.read().await.get(server).cloned();
        match connection {
            Some(c) => c.is_alive().await,
            None => false,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mcp_client::types::ResponsePayload;

    /// Echo server: answers every request line with its own id.
    const ECHO_SERVER: &str = r#"while IFS= read -r line; do
        id=$(printf '%s' "$line" | sed -e 's/.*"id":"\([^"]*\)".*/\1/')
        printf '{"jsonrpc":"2.0","id":"%s","result":{"echo":"%s"}}\n' "$id" "$id"
    done"#;

    fn sh(script: &str) -> ServerDescriptor {
        ServerDescriptor::stdio("sh", &["-c", script])
    }

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            request_timeout_ms: 3_000,
            poll_interval_ms: 20,
            ..TransportSettings::default()
        }
    }

    fn request(id: &str) -> ProtocolRequest {
        ProtocolRequest::new(id, "tools/list", None)
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let transport = StdioTransport::new(fast_settings());
        transport.connect("echo", &sh(ECHO_SERVER)).await.unwrap();

        assert!(transport.is_connected("echo").await);
        assert_eq!(transport.state("echo").await, ConnectionState::Ready);

        transport.disconnect("echo").await;
        assert!(!transport.is_connected("echo").await);
        assert_eq!(transport.state("echo").await, ConnectionState::Disconnected);

        // Idempotent.
        transport.disconnect("echo").await;
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let transport = StdioTransport::new(TransportSettings::default());
        let start = Instant::now();
        let err = transport.send_request("ghost", &request("1")).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let transport = StdioTransport::new(fast_settings());
        transport.connect("echo", &sh(ECHO_SERVER)).await.unwrap();

        let resp = transport.send_request("echo", &request("abc")).await.unwrap();
        assert_eq!(resp.id, "abc");
        assert_eq!(resp.result().unwrap()["echo"], "abc");

        transport.disconnect("echo").await;
    }

    #[tokio::test]
    async fn test_banner_line_before_response_is_skipped() {
        let script = r#"read -r line
            echo "Weather server v1.2 ready"
            echo '{"jsonrpc":"2.0","id":"1","result":{"temp":21}}'
            sleep 5"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("weather", &sh(script)).await.unwrap();

        let resp = transport.send_request("weather", &request("1")).await.unwrap();
        assert_eq!(
            resp.payload,
            ResponsePayload::Result(serde_json::json!({"temp": 21}))
        );

        transport.disconnect("weather").await;
    }

    #[tokio::test]
    async fn test_startup_banner_is_drained() {
        let script = r#"echo "Starting MCP server..."
            echo "Loaded 3 tools"
            read -r line
            echo '{"jsonrpc":"2.0","id":"1","result":{"ok":true}}'
            sleep 5"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("banner", &sh(script)).await.unwrap();

        let resp = transport.send_request("banner", &request("1")).await.unwrap();
        assert_eq!(resp.result().unwrap()["ok"], true);

        transport.disconnect("banner").await;
    }

    #[tokio::test]
    async fn test_array_wrapped_response() {
        let script = r#"read -r line
            echo '[{"jsonrpc":"2.0","id":"1","result":{"tools":[]}}]'
            sleep 5"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("arr", &sh(script)).await.unwrap();

        let resp = transport.send_request("arr", &request("1")).await.unwrap();
        assert_eq!(resp, ProtocolResponse::success("1", serde_json::json!({"tools": []})));

        transport.disconnect("arr").await;
    }

    #[tokio::test]
    async fn test_too_many_noisy_lines() {
        let script = r#"read -r line
            i=0
            while [ $i -lt 11 ]; do echo "log line $i"; i=$((i+1)); done
            sleep 10"#;
        let settings = TransportSettings {
            request_timeout_ms: 8_000,
            ..fast_settings()
        };
        let transport = StdioTransport::new(settings);
        transport.connect("noisy", &sh(script)).await.unwrap();

        let start = Instant::now();
        let err = transport.send_request("noisy", &request("1")).await.unwrap_err();
        match err {
            McpError::TooManyNoisyLines { attempts, .. } => assert_eq!(attempts, 10),
            other => panic!("expected TooManyNoisyLines, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(8));

        transport.disconnect("noisy").await;
    }

    #[tokio::test]
    async fn test_eof_before_json_is_no_response() {
        let script = r#"read -r line
            echo "shutting down"
            exit 0"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("quitter", &sh(script)).await.unwrap();

        let err = transport.send_request("quitter", &request("1")).await.unwrap_err();
        match err {
            McpError::NoResponse { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected NoResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out_and_stays_connected() {
        let settings = TransportSettings {
            request_timeout_ms: 300,
            ..fast_settings()
        };
        let transport = StdioTransport::new(settings);
        transport
            .connect("silent", &sh("read -r line; sleep 10"))
            .await
            .unwrap();

        let err = transport.send_request("silent", &request("1")).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.is_connected("silent").await);

        transport.disconnect("silent").await;
    }

    #[tokio::test]
    async fn test_malformed_json_line() {
        let script = r#"read -r line
            echo '{"jsonrpc":"2.0","id":"1"}'
            sleep 5"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("bad", &sh(script)).await.unwrap();

        let err = transport.send_request("bad", &request("1")).await.unwrap_err();
        assert!(matches!(err, McpError::MalformedResponse { .. }));

        transport.disconnect("bad").await;
    }

    #[tokio::test]
    async fn test_non_ascii_payload_survives() {
        let script = r#"read -r line
            echo '{"jsonrpc":"2.0","id":"1","result":{"text":"공지사항 ✓ 日本語"}}'
            sleep 5"#;
        let transport = StdioTransport::new(fast_settings());
        transport.connect("utf8", &sh(script)).await.unwrap();

        let resp = transport.send_request("utf8", &request("1")).await.unwrap();
        assert_eq!(resp.result().unwrap()["text"], "공지사항 ✓ 日本語");

        transport.disconnect("utf8").await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let transport = Arc::new(StdioTransport::new(fast_settings()));
        transport.connect("echo", &sh(ECHO_SERVER)).await.unwrap();

        let (first, second) = (request("first"), request("second"));
        let (a, b) = tokio::join!(
            transport.send_request("echo", &first),
            transport.send_request("echo", &second),
        );
        assert_eq!(a.unwrap().id, "first");
        assert_eq!(b.unwrap().id, "second");

        transport.disconnect("echo").await;
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let transport = StdioTransport::new(fast_settings());
        transport.connect("echo", &sh(ECHO_SERVER)).await.unwrap();
        transport.connect("echo", &sh(ECHO_SERVER)).await.unwrap();

        assert_eq!(transport.connections.read().await.len(), 1);
        transport.disconnect("echo").await;
    }

    #[tokio::test]
    async fn test_dead_process_is_not_connected() {
        let transport = StdioTransport::new(fast_settings());
        transport.connect("brief", &sh("exit 0")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_connected("brief").await);

        transport.disconnect("brief").await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let transport = StdioTransport::new(fast_settings());
        let err = transport
            .connect("missing", &ServerDescriptor::stdio("/nonexistent/mcp-server", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert!(!transport.is_connected("missing").await);
    }

    #[tokio::test]
    async fn test_missing_command_is_invalid_config() {
        let transport = StdioTransport::new(fast_settings());
        let err = transport
            .connect("empty", &ServerDescriptor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let tmp = std::env::temp_dir();
        let mut descriptor = sh(r#"read -r line
            printf '{"jsonrpc":"2.0","id":"1","result":{"greeting":"%s","dir":"%s"}}\n' "$GREETING" "$(pwd)"
            sleep 5"#);
        descriptor.env.insert("GREETING".into(), "hello".into());
        descriptor.cwd = Some(tmp.to_string_lossy().into_owned());

        let transport = StdioTransport::new(fast_settings());
        transport.connect("env", &descriptor).await.unwrap();

        let resp = transport.send_request("env", &request("1")).await.unwrap();
        let result = resp.result().unwrap();
        assert_eq!(result["greeting"], "hello");
        let dir = std::path::PathBuf::from(result["dir"].as_str().unwrap());
        assert_eq!(dir.canonicalize().unwrap(), tmp.canonicalize().unwrap());

        transport.disconnect("env").await;
    }
}
