//! mesh-identity-controller - the identity service.
//!
//! # Examples
//!
//! ```bash
//! # Generate a trust anchor and issuer for a new cluster
//! mesh-identity-controller bootstrap --out ./identity
//!
//! # Serve Certify on :8083
//! mesh-identity-controller serve \
//!     --trust-anchors ./identity/trust-anchors.pem \
//!     --issuer ./identity/issuer
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod bootstrap;
mod grpc;
mod serve;

/// Issues identity certificates to mesh workloads.
#[derive(Parser)]
#[command(name = "mesh-identity-controller")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format.
    #[arg(long, env = "MESH_IDENTITY_LOG_FORMAT", value_enum, default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Certify API
    Serve(serve::ServeArgs),

    /// Generate a trust anchor and issuer credentials
    Bootstrap(bootstrap::BootstrapArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Plain,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let result = match cli.command {
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Bootstrap(args) => bootstrap::execute(args).await,
    };
    if let Err(e) = &result {
        tracing::error!(error = %format_args!("{e:#}"), "fatal");
    }
    result
}
