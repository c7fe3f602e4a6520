use serde::Deserialize;
use std::fs;

use crate::error::{FsError, Result};

const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7000
}
fn default_metadata_dir() -> String {
    "metadata".to_string()
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_replication_factor() -> usize {
    3
}
fn default_distance_weight() -> f64 {
    0.6
}
fn default_space_weight() -> f64 {
    0.4
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_failure_threshold() -> u64 {
    3
}
fn default_cron_interval() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    30
}
fn default_base_port() -> u16 {
    7100
}
fn default_data_dir() -> String {
    "chunks".to_string()
}
fn default_space_limit_mb() -> u64 {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_output() -> String {
    "stdout".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64, // Maximum payload per chunk in bytes
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize, // Target replica count per chunk
    #[serde(default = "default_distance_weight")]
    pub distance_weight: f64, // W_dist in placement scoring
    #[serde(default = "default_space_weight")]
    pub space_weight: f64, // W_space in placement scoring
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64, // Period of the membership reaper, in seconds
    #[serde(default = "default_failure_threshold")]
    pub heartbeat_failure_threshold: u64, // Missed intervals before a server is reaped
    #[serde(default = "default_cron_interval")]
    pub cron_interval: u64, // Period of the replication repair worker, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64, // Outbound RPC deadline in seconds
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are total")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_host")]
    pub host: String, // Address advertised to the coordinator and bound locally
    #[serde(default = "default_base_port")]
    pub base_port: u16, // Starting port for auto-assignment
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64, // Seconds between heartbeats to the coordinator
    #[serde(default = "default_space_limit_mb")]
    pub space_limit_mb: u64, // Per-server capacity in MiB
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are total")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_chunk_size")]
    pub upload_chunk_size: u64, // Client-side split size; should equal coordinator chunk_size
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are total")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // Log level filter (e.g. "debug", "info")
    #[serde(default = "default_log_output")]
    pub output: String, // "stdout" or "file"
}

impl Default for LogConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are total")
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub log: LogConfig,
}

pub fn load_config(path: &str) -> Result<Config> {
    let config_content = fs::read_to_string(path)
        .map_err(|e| FsError::Config(format!("cannot read '{}': {}", path, e)))?;
    let config: Config = toml::from_str(&config_content)
        .map_err(|e| FsError::Config(format!("cannot parse '{}': {}", path, e)))?;
    if config.coordinator.replication_factor == 0 {
        return Err(FsError::Config(
            "replication_factor must be at least 1".to_string(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.coordinator.chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.coordinator.replication_factor, 3);
        assert!((config.coordinator.distance_weight - 0.6).abs() < f64::EPSILON);
        assert!((config.coordinator.space_weight - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.storage.heartbeat_interval, 5);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_file_overrides_only_named_options() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[coordinator]\nport = 9000\nreplication_factor = 2\n\n[storage]\nbase_port = 9100\n"
        )
        .unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.coordinator.port, 9000);
        assert_eq!(config.coordinator.replication_factor, 2);
        assert_eq!(config.coordinator.host, "127.0.0.1");
        assert_eq!(config.storage.base_port, 9100);
        assert_eq!(config.storage.space_limit_mb, 1024);
    }

    #[test]
    fn zero_replication_factor_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator]\nreplication_factor = 0\n").unwrap();
        assert!(load_config(file.path().to_str().unwrap()).is_err());
    }
}
