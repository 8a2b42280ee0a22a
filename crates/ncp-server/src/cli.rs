// crates/ncp-server/src/cli.rs
// Command-line entry: serve MCP over stdio

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ncp::config::EnvConfig;
use ncp::mcp::NcpServer;
use ncp::orchestrator::Orchestrator;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code for an unrecoverable configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for an upstream protocol violation.
pub const EXIT_PROTOCOL: i32 = 2;
/// Exit code for a clean shutdown by signal.
pub const EXIT_SIGNAL: i32 = 130;

#[derive(Parser)]
#[command(name = "ncp", version, about = "One MCP server multiplexing all of your MCP servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Profile to serve (overrides NCP_PROFILE).
    #[arg(long, global = true)]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP over stdio (the default).
    Serve,
}

/// Run the selected command and return the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        None | Some(Commands::Serve) => run_mcp_server(cli.profile).await,
    }
}

/// Run the MCP server with stdio transport.
async fn run_mcp_server(profile_override: Option<String>) -> Result<i32> {
    let env = EnvConfig::load();
    for warning in env.validate().warnings {
        warn!("{}", warning);
    }

    let profile = profile_override.unwrap_or_else(|| env.profile.clone());

    let orchestrator = Arc::new(
        Orchestrator::new(env).context("failed to load configuration")?,
    );
    if let Err(e) = orchestrator.initialize(&profile).await {
        eprintln!("[ncp] {}", e.to_user_string());
        return Ok(EXIT_CONFIG);
    }

    let server = NcpServer::new(orchestrator.clone());
    let transport = rmcp::transport::io::stdio();
    let service = match rmcp::serve_server(server, transport).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("[ncp] upstream handshake failed: {}", e);
            orchestrator.shutdown().await;
            return Ok(EXIT_PROTOCOL);
        }
    };
    info!("NCP serving MCP over stdio");

    tokio::select! {
        result = service.waiting() => {
            orchestrator.shutdown().await;
            match result {
                Ok(_) => Ok(0),
                Err(e) => {
                    eprintln!("[ncp] upstream session error: {}", e);
                    Ok(EXIT_PROTOCOL)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Signal received; shutting down");
            orchestrator.shutdown().await;
            Ok(EXIT_SIGNAL)
        }
    }
}
