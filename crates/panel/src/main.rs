use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use panel::store::Store;
use panel::{ControlPlane, PanelConfig};

#[derive(Debug, Parser)]
#[command(name = "panel")]
#[command(about = "hosting control plane: job dispatch and agent coordination", version, author)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the control plane HTTP server (default)
    Serve {
        /// TOML config file; PANEL_* environment variables override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the effective configuration and exit
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve { config: None, bind: None });

    match command {
        Commands::Serve { config, bind } => {
            let mut config = PanelConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            serve(config).await
        }
        Commands::Config { config } => {
            let mut config = PanelConfig::load(config.as_deref())?;
            for secret in [&mut config.bootstrap_token, &mut config.admin_token, &mut config.master_key] {
                if !secret.is_empty() {
                    *secret = "<redacted>".to_string();
                }
            }
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: PanelConfig) -> anyhow::Result<()> {
    if config.bootstrap_token.is_empty() {
        warn!("bootstrap_token is empty, agent registration is disabled");
    }
    if config.master_key.is_empty() {
        anyhow::bail!("master_key must be set to seal agent secrets");
    }

    let store = if config.persist {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = Store::persistent(config.state_file());
        store.load_from_disk().await?;
        store
    } else {
        Store::in_memory()
    };

    let bind = config.bind.clone();
    let plane = Arc::new(ControlPlane::builder(config).store(store).build());
    let sweep = plane.clone().spawn_stale_sweep();

    let result = panel::web::serve(plane, &bind, shutdown_signal()).await;
    sweep.abort();
    info!("control plane stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}
