use anyhow::bail;
use clap::{Arg, Command};
use std::path::Path;

use geofs::client::FsClient;
use geofs::config::load_config;
use geofs::util::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("client")
        .about("GeoFS client: upload, download and append files")
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
                .default_value("client")
                .help("Client identity used for ranking"),
        )
        .arg(
            Arg::new("x")
                .long("x")
                .value_name("FLOAT")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.0"),
        )
        .arg(
            Arg::new("y")
                .long("y")
                .value_name("FLOAT")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.0"),
        )
        .subcommand(
            Command::new("upload")
                .about("Upload a local file")
                .arg(Arg::new("local").required(true).value_name("LOCAL_PATH"))
                .arg(Arg::new("remote").required(true).value_name("REMOTE_PATH")),
        )
        .subcommand(
            Command::new("download")
                .about("Download a remote file")
                .arg(Arg::new("remote").required(true).value_name("REMOTE_PATH"))
                .arg(Arg::new("local").required(true).value_name("LOCAL_PATH")),
        )
        .subcommand(
            Command::new("append")
                .about("Append the bytes of a local file to a remote file")
                .arg(Arg::new("remote").required(true).value_name("REMOTE_PATH"))
                .arg(Arg::new("local").required(true).value_name("LOCAL_PATH")),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let id = matches.get_one::<String>("id").expect("has default");
    let x = *matches.get_one::<f64>("x").expect("has default");
    let y = *matches.get_one::<f64>("y").expect("has default");

    let config = load_config(config_path)?;
    let _log_guard = init_tracing(&config.log, config.client.log_path.as_deref());
    let coordinator_address = format!("{}:{}", config.coordinator.host, config.coordinator.port);

    let client = FsClient::connect(id, (x, y), &coordinator_address, config.client.clone()).await?;

    match matches.subcommand() {
        Some(("upload", args)) => {
            let local = args.get_one::<String>("local").expect("required");
            let remote = args.get_one::<String>("remote").expect("required");
            client.upload(Path::new(local), remote).await?;
            println!("uploaded {} -> {}", local, remote);
        }
        Some(("download", args)) => {
            let remote = args.get_one::<String>("remote").expect("required");
            let local = args.get_one::<String>("local").expect("required");
            client.download(remote, Path::new(local)).await?;
            println!("downloaded {} -> {}", remote, local);
        }
        Some(("append", args)) => {
            let remote = args.get_one::<String>("remote").expect("required");
            let local = args.get_one::<String>("local").expect("required");
            let data = tokio::fs::read(local).await?;
            client.append(remote, &data).await?;
            println!("appended {} bytes to {}", data.len(), remote);
        }
        _ => bail!("expected a subcommand: upload, download or append"),
    }
    Ok(())
}
