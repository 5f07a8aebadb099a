//! Hostplane control service binary.
//!
//! Runs the control plane for orchestrating hosted sites.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostplane_control::config::ProvisionerType;
use hostplane_control::{HostplaneConfig, HostplaneService};

/// Hostplane control service.
#[derive(Parser, Debug)]
#[command(name = "hostplane-control")]
#[command(about = "Orchestrate the lifecycle of hosted sites")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Use in-process mock provisioners.
    #[arg(long)]
    mock: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    let filter = if cli.verbose {
        "debug,hyper=info,tower=info"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("hostplane control service starting");

    // An explicit config file must load; the default one is optional
    let mut config = match cli.config.as_deref() {
        Some(path) => HostplaneConfig::from_file(path)?,
        None => HostplaneConfig::load().unwrap_or_else(|e| {
            info!(error = %e, "failed to load config, using defaults");
            HostplaneConfig::default()
        }),
    };
    if cli.mock {
        config.orchestrator.provisioners = ProvisionerType::Mock;
    }

    info!(
        listen = ?config.server.listen,
        provisioners = ?config.orchestrator.provisioners,
        sites_root = %config.storage.sites_root.display(),
        docker_socket = %config.docker.socket.display(),
        "configuration loaded"
    );

    HostplaneService::new(config).run().await?;
    Ok(())
}
