//! Job tracker reference backend
//!
//! In-memory REST API speaking the same protocol as the production
//! backend, for local development and offline testing.
//!
//! # Usage
//!
//! ```bash
//! # Start server with defaults (port 3000)
//! cargo run --bin sync-server
//!
//! # Custom port
//! cargo run --bin sync-server -- --port 8080
//! ```

use clap::Parser;
use jobtrack_sync::server::{start_server, ServerConfig};

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(version, about = "In-memory job tracker API")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Disable CORS headers
    #[arg(long)]
    no_cors: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        port: args.port,
        host: args.host,
        enable_cors: !args.no_cors,
    };

    start_server(config).await
}
