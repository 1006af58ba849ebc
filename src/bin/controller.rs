//! Controller binary

use clap::{Parser, Subcommand};
use sds_controller::common::{ControllerConfig, LogFormat};
use sds_controller::Controller;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sds-controller")]
#[command(about = "Control plane for a replicated block-storage cluster")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller
    Serve {
        /// Config file (defaults to $SDS_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the API listen address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override the state directory
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Print the effective configuration and exit
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(config: &ControllerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            state_dir,
        } => {
            // File, then SDS__* environment, then flags
            let mut config = ControllerConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(dir) = state_dir {
                config.state_dir = dir;
            }
            init_tracing(&config);

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("shutdown requested");
                        signal.cancel();
                    }
                    Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
                }
            });

            Controller::new(config).serve(shutdown).await?;
        }

        Commands::Config { config } => {
            let config = ControllerConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
