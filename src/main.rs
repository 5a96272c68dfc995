//! mcp-conduit: command-line front end for the MCP connection registry.
//!
//! Connects the configured servers, then lists their tools, sends raw
//! JSON-RPC requests, or calls a tool. Results go to stdout as JSON; logs go
//! to stderr or the rotated log file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mcp_conduit::mcp_client::{
    call_tool, load_or_default, next_request_id, CallContext, ConnectionRegistry,
    McpServersConfig, ProtocolRequest,
};

/// Talk to MCP servers over stdio or SSE.
#[derive(Parser, Debug)]
#[command(name = "mcp-conduit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the servers config (JSON or YAML)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Write logs to the rotated log file instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every configured server and report its status
    Servers,

    /// Print cached tools for all servers, or for one
    Tools {
        /// Only connect and list this server
        server: Option<String>,
    },

    /// Send one raw JSON-RPC request and print the response
    Request {
        server: String,
        method: String,
        /// Request params as a JSON object
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
    },

    /// Call a tool and print the result
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, value_name = "JSON", default_value = "{}")]
        args: String,
        /// Access token injected into the tool arguments
        #[arg(long)]
        access_token: Option<String>,
        /// Session id recorded with the call
        #[arg(long)]
        session_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    mcp_conduit::init_tracing(args.log_file);

    let config = match load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let registry = ConnectionRegistry::new(config.settings);
    let result = run(&registry, &config, args.command).await;
    registry.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    registry: &ConnectionRegistry,
    config: &McpServersConfig,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Servers => {
            let errors = registry.initialize(&config.servers).await;
            let connected = registry.connected_server_names().await;

            let mut rows = Vec::new();
            for name in registry.registered_server_names().await {
                let descriptor = registry.descriptor(&name).await.unwrap_or_default();
                let error = errors
                    .iter()
                    .find(|(failed, _)| failed == &name)
                    .map(|(_, e)| e.to_string());
                rows.push(serde_json::json!({
                    "name": name,
                    "transport": descriptor.transport_kind(&name),
                    "connected": connected.contains(&name),
                    "tools": registry.get_tools(&name).await.len(),
                    "error": error,
                }));
            }
            print_json(&rows)
        }

        Command::Tools { server: None } => {
            registry.initialize(&config.servers).await;
            print_json(&registry.get_all_tools().await)
        }

        Command::Tools {
            server: Some(server),
        } => {
            connect_one(registry, config, &server).await?;
            print_json(&registry.get_tools(&server).await)
        }

        Command::Request {
            server,
            method,
            params,
        } => {
            let params = params
                .as_deref()
                .map(|p| serde_json::from_str::<serde_json::Value>(p))
                .transpose()
                .context("--params is not valid JSON")?;

            connect_one(registry, config, &server).await?;
            let request = ProtocolRequest::new(next_request_id("cli"), &method, params);
            let response = registry
                .send_request(&server, &request)
                .await
                .with_context(|| format!("request '{method}' to '{server}' failed"))?;
            print_json(&response)
        }

        Command::Call {
            server,
            tool,
            args,
            access_token,
            session_id,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;

            let mut ctx = CallContext::new();
            ctx.access_token = access_token;
            ctx.session_id = session_id;

            connect_one(registry, config, &server).await?;
            let result = call_tool(registry, &ctx, &server, &tool, arguments)
                .await
                .with_context(|| format!("tool '{tool}' on '{server}' failed"))?;
            print_json(&result)
        }
    }
}

/// Connect only the named server.
async fn connect_one(
    registry: &ConnectionRegistry,
    config: &McpServersConfig,
    server: &str,
) -> anyhow::Result<()> {
    let Some(descriptor) = config.servers.get(server) else {
        bail!("server '{server}' is not configured");
    };
    registry
        .register_server(server, descriptor.clone())
        .await
        .with_context(|| format!("failed to connect '{server}'"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_call_command() {
        let args = Args::try_parse_from([
            "mcp-conduit",
            "--config",
            "servers.yaml",
            "call",
            "weather",
            "forecast",
            "--args",
            r#"{"city":"Seoul"}"#,
            "--access-token",
            "tok",
        ])
        .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("servers.yaml")));
        match args.command {
            Command::Call {
                server,
                tool,
                args,
                access_token,
                session_id,
            } => {
                assert_eq!(server, "weather");
                assert_eq!(tool, "forecast");
                assert_eq!(args, r#"{"city":"Seoul"}"#);
                assert_eq!(access_token.as_deref(), Some("tok"));
                assert!(session_id.is_none());
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_call_args_default_to_empty_object() {
        let args = Args::try_parse_from(["mcp-conduit", "call", "fs", "list"]).unwrap();
        match args.command {
            Command::Call { args, .. } => assert_eq!(args, "{}"),
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_one_rejects_unknown_server() {
        let registry = ConnectionRegistry::new(Default::default());
        let err = connect_one(&registry, &McpServersConfig::default(), "ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
