//! Standalone registry server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use registry_server::{run_server, Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "registry-server")]
#[command(about = "Private npm-compatible package registry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry server
    Start {
        /// JSON configuration file
        #[arg(long, default_value = "registry.json")]
        config: PathBuf,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,

        /// Data directory for package storage
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Externally visible registry URL used in tarball links
        #[arg(short, long)]
        url: Option<String>,

        /// Publisher allow-list file (`{"publishers": [...]}`)
        #[arg(long)]
        publishers: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    Config {
        /// JSON configuration file
        #[arg(long, default_value = "registry.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = registry_logging::init_subscriber();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            host,
            port,
            data,
            url,
            publishers,
        } => {
            let mut config = Config::load_or_default(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data) = data {
                config.storage.data_dir = data;
            }
            if let Some(url) = url {
                config.server.base_url = Some(url);
            }
            if let Some(publishers) = publishers {
                config.security.publishers_file = Some(publishers);
            }
            run_server(config).await
        }
        Commands::Config { config } => {
            let config = Config::load_or_default(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
