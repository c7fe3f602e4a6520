use anyhow::{bail, Context};
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use geofs::config::load_config;
use geofs::storage_impl;
use geofs::storage_service::{load_server_info, store_server_info, ServerInfo, StorageService};
use geofs::util::init_tracing;

/// How many ports past base_port to probe before giving up.
const PORT_SCAN_RANGE: u16 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("storage_server")
        .about("Starts a GeoFS storage server")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .value_name("STRING")
                .required(true)
                .help("Server identity; also names the data subdirectory"),
        )
        .arg(
            Arg::new("x")
                .long("x")
                .value_name("FLOAT")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.0")
                .help("X coordinate of this server"),
        )
        .arg(
            Arg::new("y")
                .long("y")
                .value_name("FLOAT")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.0")
                .help("Y coordinate of this server"),
        )
        .arg(
            Arg::new("space")
                .long("space")
                .value_name("MIB")
                .value_parser(clap::value_parser!(u64))
                .help("Capacity in MiB, overriding the config"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let id = matches.get_one::<String>("id").expect("required");
    let x = *matches.get_one::<f64>("x").expect("has default");
    let y = *matches.get_one::<f64>("y").expect("has default");

    let config = load_config(config_path)?;
    let mut storage_config = config.storage.clone();
    if let Some(space) = matches.get_one::<u64>("space") {
        storage_config.space_limit_mb = *space;
    }
    let _log_guard = init_tracing(&config.log, storage_config.log_path.as_deref());

    // Each server keeps its chunks under <data_dir>/<id> so several can
    // share a host.
    let data_dir = PathBuf::from(&storage_config.data_dir).join(id);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

    // Restart with the same port when an identity file is present;
    // otherwise probe upward from base_port.
    let (listener, port) = match load_server_info(&data_dir)? {
        Some(info) => {
            let bind = format!("{}:{}", storage_config.host, info.port);
            let listener = TcpListener::bind(&bind)
                .await
                .with_context(|| format!("cannot rebind previous port {}", bind))?;
            (listener, info.port)
        }
        None => {
            let mut bound = None;
            for port in storage_config.base_port..storage_config.base_port + PORT_SCAN_RANGE {
                let bind = format!("{}:{}", storage_config.host, port);
                if let Ok(listener) = TcpListener::bind(&bind).await {
                    bound = Some((listener, port));
                    break;
                }
            }
            match bound {
                Some(found) => found,
                None => bail!(
                    "no free port in {}..{}",
                    storage_config.base_port,
                    storage_config.base_port + PORT_SCAN_RANGE
                ),
            }
        }
    };
    store_server_info(
        &data_dir,
        &ServerInfo {
            id: id.clone(),
            port,
        },
    )?;

    let address = format!("{}:{}", storage_config.host, port);
    let coordinator_address = format!("{}:{}", config.coordinator.host, config.coordinator.port);
    let service = Arc::new(StorageService::new(
        id,
        &address,
        (x, y),
        &coordinator_address,
        &data_dir,
        storage_config,
    )?);

    // A down coordinator is not fatal: the heartbeat path re-registers
    // once it comes back.
    if let Err(e) = service.register_with_coordinator().await {
        warn!("initial registration failed: {}", e);
    } else {
        info!("registered with coordinator at {}", coordinator_address);
    }
    service.start_heartbeat();

    storage_impl::serve(service, listener).await?;
    Ok(())
}
