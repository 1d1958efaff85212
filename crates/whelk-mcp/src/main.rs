//! Whelk MCP Server
//!
//! This binary runs a whelk session as an MCP server over stdio. It exposes
//! shell session tools (run_command, list_files, history, and shell
//! management) that let AI assistants execute commands in persistent
//! working directories.

use std::time::Duration;

use clap::Parser;
use rmcp::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use whelk::{ResourceLimits, Whelk};
use whelk_mcp::WhelkServer;

#[derive(Parser, Debug)]
#[command(name = "whelk-mcp")]
#[command(about = "MCP server exposing whelk shell sessions as tools")]
struct Args {
    /// Interpreter binary commands are run through
    #[arg(long, default_value = "sh")]
    interpreter: String,

    /// Default wall-clock timeout per command, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Cap on captured output per stream, in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_output_bytes: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - output to stderr so it doesn't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    tracing::info!("Starting whelk MCP server");

    let whelk = Whelk::builder()
        .interpreter(args.interpreter)
        .limits(ResourceLimits {
            max_output_bytes: args.max_output_bytes,
            timeout: Duration::from_millis(args.timeout_ms),
        })
        .build();
    let server = WhelkServer::new(whelk);

    // Serve over stdio
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Whelk MCP server running");

    // Wait for the service to complete
    service.waiting().await?;

    tracing::info!("Whelk MCP server shutting down");

    Ok(())
}
