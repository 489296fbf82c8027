use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use maestro::{MaestroConfig, Workspace, start_podman};

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Build and run container images on remote Podman hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the orchestrator
    Serve {
        /// Bind address for the HTTP API
        #[arg(long, default_value = "127.0.0.1:3003")]
        bind: String,
        /// Path to maestro.json (defaults to MAESTRO_CONFIG, then the XDG and local locations)
        #[arg(long, env = "MAESTRO_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Validate the configuration and list the configured hosts and images
    CheckConfig {
        #[arg(long, env = "MAESTRO_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("maestro=info".parse()?)
                .add_directive("bollard=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, config } => {
            let config = MaestroConfig::load(config)?;
            info!(
                "Using images directory {} with {} server(s)",
                config.internal_dir.display(),
                config.servers.len()
            );

            let maestro = start_podman(&config).await?;
            let app = maestro::api::create_router(maestro.clone());

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Server started at http://{}", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received shutdown signal");
                })
                .await?;

            maestro.shutdown().await;
        }
        Commands::CheckConfig { config } => {
            let config = MaestroConfig::load(config)?;

            println!("Images directory: {}", config.internal_dir.display());
            println!(
                "Reconcile interval: {}s",
                config.reconcile_interval().as_secs()
            );
            println!("Servers ({}):", config.servers.len());
            for (name, server) in &config.servers {
                println!("  {}: {}", name, server.address());
            }

            let images = Workspace::open(&config.internal_dir)?.scan().await?;
            println!("Images ({}):", images.len());
            for image in images {
                println!("  {}", image);
            }
        }
    }

    Ok(())
}
