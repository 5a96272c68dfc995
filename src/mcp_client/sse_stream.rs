//! SSE event stream manager.
//!
//! Owns one long-lived `GET {base}/mcp/events` subscription per server and
//! the request-id → pending-slot table shared by every SSE server. Events
//! whose `id` matches a pending request complete that request; everything
//! else is logged and dropped.
//!
//! Streams are never reconnected automatically. When one ends its entry is
//! removed, but pending requests are left for the transport to clean up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::protocol::{id_to_string, parse_response_value};
use super::types::ProtocolResponse;

/// What a pending slot resolves to.
pub type SlotResult = Result<ProtocolResponse, McpError>;

/// Receiving half of a pending request slot.
pub type PendingSlot = oneshot::Receiver<SlotResult>;

struct PendingEntry {
    server: String,
    sender: oneshot::Sender<SlotResult>,
}

struct StreamEntry {
    client_id: String,
    task: JoinHandle<()>,
}

/// Event subscriptions plus the global pending-request table.
pub struct SseStreamManager {
    http: reqwest::Client,
    stream_timeout: Duration,
    pending: Mutex<HashMap<String, PendingEntry>>,
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl SseStreamManager {
    pub fn new(http: reqwest::Client, stream_timeout: Duration) -> Self {
        Self {
            http,
            stream_timeout,
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Streams ─────────────────────────────────────────────────────────────

    /// Open the event subscription for `server` in a background task.
    ///
    /// Replaces (and aborts) any subscription already running for `server`.
    pub fn start_stream(
        self: &Arc<Self>,
        server: &str,
        base_url: &str,
        client_id: &str,
        headers: &HashMap<String, String>,
    ) {
        let url = format!("{}/mcp/events", base_url.trim_end_matches('/'));

        let mut request = self
            .http
            .get(&url)
            .query(&[("clientId", client_id)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .timeout(self.stream_timeout);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let manager = Arc::clone(self);
        let server_name = server.to_string();
        let stream_client_id = client_id.to_string();

        // Held across the spawn so a stream that ends at once cannot try to
        // remove its entry before it is inserted.
        let mut streams = self.lock_streams();
        let task = tokio::spawn(async move {
            manager
                .run_stream(&server_name, &stream_client_id, request)
                .await;
        });

        let previous = streams.insert(
            server.to_string(),
            StreamEntry {
                client_id: client_id.to_string(),
                task,
            },
        );
        drop(streams);
        if let Some(old) = previous {
            tracing::warn!(server, "replacing existing event stream");
            old.task.abort();
        }

        tracing::info!(server, url = %url, client_id, "event stream started");
    }

    async fn run_stream(&self, server: &str, client_id: &str, request: reqwest::RequestBuilder) {
        match request.send().await {
            Err(e) => {
                tracing::warn!(server, error = %e, "event stream connection failed");
            }
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(server, status = %response.status(), "event stream rejected");
            }
            Ok(response) => {
                let mut events = Box::pin(parse_event_stream(server, response.bytes_stream()));
                while let Some(event) = events.next().await {
                    match event {
                        Ok(data) => {
                            self.handle_event(server, &data);
                        }
                        Err(e) => {
                            tracing::warn!(server, error = %e, "event stream error");
                            break;
                        }
                    }
                }
                tracing::info!(server, "event stream ended");
            }
        }

        let mut streams = self.lock_streams();
        if streams.get(server).is_some_and(|s| s.client_id == client_id) {
            streams.remove(server);
        }
    }

    /// Abort the subscription for `server`, if any.
    pub fn stop_stream(&self, server: &str) {
        if let Some(entry) = self.lock_streams().remove(server) {
            entry.task.abort();
            tracing::info!(server, "event stream stopped");
        }
    }

    #[cfg(test)]
    pub(crate) fn has_stream(&self, server: &str) -> bool {
        self.lock_streams().contains_key(server)
    }

    // ─── Pending Requests ────────────────────────────────────────────────────

    /// Create the slot a response for `request_id` will be delivered to.
    ///
    /// The caller owns cleanup on timeout via [`Self::remove_pending`]; the
    /// manager only removes entries it completes.
    pub fn register_pending(&self, server: &str, request_id: &str) -> PendingSlot {
        let (sender, receiver) = oneshot::channel();
        let previous = self.lock_pending().insert(
            request_id.to_string(),
            PendingEntry {
                server: server.to_string(),
                sender,
            },
        );
        if previous.is_some() {
            // The earlier caller sees its slot dropped.
            tracing::warn!(server, request_id, "duplicate in-flight request id");
        }
        receiver
    }

    /// Drop the slot for `request_id` without completing it.
    pub fn remove_pending(&self, request_id: &str) -> bool {
        self.lock_pending().remove(request_id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Complete every tracked slot with `RequestCancelled`.
    ///
    /// Not scoped to one server: ids are globally unique, so this is meant
    /// for teardown.
    pub fn cancel_all(&self) {
        let drained: Vec<(String, PendingEntry)> = self.lock_pending().drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!(count = drained.len(), "cancelling pending SSE requests");
        for (request_id, entry) in drained {
            let _ = entry.sender.send(Err(McpError::RequestCancelled {
                server: entry.server,
                request_id,
            }));
        }
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Route one event payload to its pending request.
    ///
    /// Returns `true` when the event completed a slot.
    pub fn handle_event(&self, server: &str, data: &str) -> bool {
        let payload = data.trim();
        let payload = payload
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(payload);
        if payload.is_empty() {
            return false;
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(server, error = %e, "dropping non-JSON event");
                return false;
            }
        };

        let id = match &value {
            serde_json::Value::Array(items) => items.first().and_then(|v| v.get("id")),
            other => other.get("id"),
        }
        .and_then(id_to_string);

        let Some(id) = id else {
            tracing::debug!(server, "dropping event without id");
            return false;
        };

        let Some(entry) = self.lock_pending().remove(&id) else {
            tracing::debug!(server, id = %id, "orphan event, no pending request");
            return false;
        };

        let outcome = parse_response_value(server, value);
        if let Err(e) = &outcome {
            tracing::warn!(server, id = %id, error = %e, "matched event is not a valid response");
        }
        if entry.sender.send(outcome).is_err() {
            tracing::debug!(server, id = %id, "pending request was abandoned before completion");
        }
        true
    }
}

// ─── Event Stream Framing ────────────────────────────────────────────────────

/// Split an HTTP body into SSE event payloads.
///
/// Events are separated by a blank line; each yields the joined contents of
/// its `data:` lines. Events without data (keep-alives, comments) are
/// skipped. Bytes are buffered until an event is complete, so a multibyte
/// character split across chunks decodes intact; an event that is not valid
/// UTF-8 is logged and dropped.
pub fn parse_event_stream<S, B, E>(
    server: &str,
    bytes: S,
) -> impl Stream<Item = Result<String, McpError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let byte_stream = Box::pin(bytes);

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), server.to_string(), false),
        |(mut byte_stream, mut buffer, server, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(event_end) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).take(event_end).collect();

                    match decode_event(&server, event) {
                        Some(data) => return Some((Ok(data), (byte_stream, buffer, server, false))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        let err = McpError::TransportError {
                            server: server.clone(),
                            reason: format!("event stream read error: {e}"),
                        };
                        return Some((Err(err), (byte_stream, buffer, server, true)));
                    }
                    None => {
                        // Trailing event without its blank-line terminator.
                        let rest = std::mem::take(&mut buffer);
                        return decode_event(&server, rest)
                            .map(|data| (Ok(data), (byte_stream, buffer, server, true)));
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn decode_event(server: &str, event: Vec<u8>) -> Option<String> {
    match String::from_utf8(event) {
        Ok(text) => extract_event_data(&text),
        Err(e) => {
            tracing::warn!(server, error = %e, "dropping event that is not valid UTF-8");
            None
        }
    }
}

/// Joined `data:` field of one SSE event, or `None` if it has no data.
pub fn extract_event_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();

    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    if data.trim().is_empty() {
        None
    } else {
        Some(data)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
