use anyhow::Context;
use clap::{Arg, Command};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use geofs::config::load_config;
use geofs::coordinator_impl;
use geofs::coordinator_service::CoordinatorService;
use geofs::util::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("coordinator")
        .about("Starts the GeoFS coordinator")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the TOML configuration file"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let config = load_config(config_path)?;
    let _log_guard = init_tracing(&config.log, config.coordinator.log_path.as_deref());

    let listen_address = format!("{}:{}", config.coordinator.host, config.coordinator.port);
    let service = Arc::new(
        CoordinatorService::new(config.coordinator.clone())
            .context("coordinator refused to start")?,
    );
    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("cannot bind {}", listen_address))?;

    service.start_membership_reaper();
    service.start_replication_worker();

    let shutdown = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.shutdown();
            std::process::exit(0);
        }
    });

    coordinator_impl::serve(service, listener).await?;
    Ok(())
}
