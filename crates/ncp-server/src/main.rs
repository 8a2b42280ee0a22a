// crates/ncp-server/src/main.rs
// NCP - Network Control Proxy for MCP

mod cli;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    // Load .env from ~/.ncp/.env only (never from CWD - a malicious repo
    // could override tokens).
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".ncp/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = cli::Cli::parse();

    // Stdout is the MCP wire, so logs go to stderr and stay quiet unless
    // NCP_DEBUG asks for more.
    let level = if ncp::config::env::parse_bool_env("NCP_DEBUG").unwrap_or(false) {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let code = match cli::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[ncp] {e:#}");
            cli::EXIT_CONFIG
        }
    };
    std::process::exit(code);
}
