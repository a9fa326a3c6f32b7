use clap::Parser;
use participant::{ParticipantConfig, load_config_from_path};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "participant", about = "Headless watch-together room participant")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/lockstep/participant.toml")]
    config: PathBuf,
    /// Override the configured display name.
    #[arg(long)]
    name: Option<String>,
    /// Override the configured server URL.
    #[arg(long)]
    url: Option<String>,
}

fn apply_overrides(mut config: ParticipantConfig, args: &Args) -> ParticipantConfig {
    if let Some(name) = &args.name {
        config.display_name = name.clone();
    }
    if let Some(url) = &args.url {
        config.server_url = url.clone();
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match load_config_from_path(&args.config) {
        Ok(config) => apply_overrides(config, &args),
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    match participant::run(config, shutdown_rx).await {
        Ok(reason) => info!(?reason, "participant exited"),
        Err(e) => {
            error!(error = %e, "participant failed");
            std::process::exit(1);
        }
    }
}
