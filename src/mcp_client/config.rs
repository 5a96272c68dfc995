//! Server configuration loading and transport tuning.
//!
//! Reads `mcp-servers.json` (or `.yaml`) into [`McpServersConfig`] and
//! expands `${VAR}` placeholders in `env` and `headers` values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::types::McpServersConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_CONDUIT_CONFIG";

/// File names probed in the working directory when no path is given.
const DEFAULT_CONFIG_FILES: &[&str] = &["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"];

// ─── Transport Settings ──────────────────────────────────────────────────────

/// Timeouts and budgets shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TransportSettings {
    /// End-to-end deadline for one request (both transports).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Sleep between stdout readiness checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Non-JSON lines tolerated while waiting for one stdio response.
    #[serde(default = "default_max_noise_lines")]
    pub max_noise_lines: u32,
    /// Lines inspected by the post-spawn banner drain.
    #[serde(default = "default_init_drain_lines")]
    pub init_drain_lines: u32,
    /// Lifetime bound for one SSE event subscription.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

fn default_request_timeout_ms() -> u64 {
    25_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_noise_lines() -> u32 {
    10
}
fn default_init_drain_lines() -> u32 {
    5
}
fn default_stream_timeout_secs() -> u64 {
    30 * 60
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_noise_lines: default_max_noise_lines(),
            init_drain_lines: default_init_drain_lines(),
            stream_timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl TransportSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Pick the config file to load.
///
/// Resolution order: explicit path, then `MCP_CONDUIT_CONFIG`, then the
/// default file names in the current directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(from_env) = std::env::var(CONFIG_ENV_VAR) {
        if !from_env.trim().is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| cwd.join(name))
        .find(|candidate| candidate.is_file())
}

/// Load a config file, choosing the parser from its extension.
///
/// `.yaml`/`.yml` are read with `serde_yaml`; everything else as JSON.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let mut config: McpServersConfig = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    expand_placeholders(&mut config);

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP server config"
    );

    Ok(config)
}

/// Resolve and load the config, treating a missing file as an empty config.
pub fn load_or_default(explicit: Option<&Path>) -> Result<McpServersConfig, McpError> {
    match resolve_config_path(explicit) {
        Some(path) => load_config(&path),
        None => {
            tracing::warn!("no MCP server config found, starting with no servers");
            Ok(McpServersConfig::default())
        }
    }
}

/// Expand `${VAR}` references in `env` and `headers` values.
fn expand_placeholders(config: &mut McpServersConfig) {
    for (name, descriptor) in config.servers.iter_mut() {
        for value in descriptor
            .env
            .values_mut()
            .chain(descriptor.headers.values_mut())
        {
            *value = expand_value(name, value);
        }
    }
}

fn expand_value(server: &str, raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder: keep the text verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                tracing::warn!(server, var, "config placeholder references unset variable");
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
