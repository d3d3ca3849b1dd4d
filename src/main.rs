use anyhow::{Context, Result};
use log::{error, info};
use safezone::app::App;
use safezone::config;
use std::path::PathBuf;

async fn run_app() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SAFEZONE_CONFIG").ok())
        .map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.logging.level.as_str()))
        .init();
    info!("Starting SafeZone monitor v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration loaded from {}", path.display());
    }

    let app = App::build(config).context("Failed to build services")?;
    app.start().await.context("Failed to start services")?;
    info!("Monitoring; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    app.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        error!("Application error: {:#}", e);
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
