use anyhow::Result;
use clap::Parser;
use netboot_iscsi::{IscsiService, JsonFileStore, SystemRunner};
use netboot_mgmt::cli::{Cli, Command};
use netboot_mgmt::{AdminApi, MgmtConfig};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { config } => serve(config).await,
        _ => cli.run().await,
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let mut config = if config_path.exists() {
        MgmtConfig::from_file(config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        MgmtConfig::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());

    tracing::info!(
        images_dir = %config.iscsi.images_dir.display(),
        data_dir = %config.iscsi.data_dir.display(),
        boot_server_ip = %config.iscsi.boot_server_ip,
        "netboot management server starting"
    );

    let store = Arc::new(JsonFileStore::open(&config.iscsi.data_dir)?);
    let service = Arc::new(IscsiService::new(
        config.iscsi.clone(),
        Arc::new(SystemRunner::new()),
        store,
    ));

    AdminApi::new(service, Arc::new(config)).serve().await
}
