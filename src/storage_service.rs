//! Storage-server state: data directories, the per-chunk transaction
//! table backing the two-phase commit, space accounting and the
//! heartbeat task.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::StorageConfig;
use crate::error::{FsError, Result};
use crate::message::{CoordinatorReply, CoordinatorRequest, Location};
use crate::wire;

/// Cached identity so a restarted server comes back with the same id and
/// port. Lives at `<data_dir>/server_info.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub port: u16,
}

pub fn load_server_info(data_dir: &Path) -> Result<Option<ServerInfo>> {
    let path = data_dir.join("server_info.json");
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::Io(e)),
    }
}

pub fn store_server_info(data_dir: &Path, info: &ServerInfo) -> Result<()> {
    let path = data_dir.join("server_info.json");
    std::fs::write(&path, serde_json::to_vec_pretty(info)?)?;
    Ok(())
}

/// In-flight transaction state for one chunk id. Committed chunks leave
/// the table; the chunk file itself is the terminal state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChunkTxn {
    Prepared { len: u64 },
    AppendPrepared { len: u64, offset: u64 },
}

impl ChunkTxn {
    pub fn reserved_bytes(&self) -> u64 {
        match self {
            ChunkTxn::Prepared { len } => *len,
            ChunkTxn::AppendPrepared { len, .. } => *len,
        }
    }
}

pub struct StorageService {
    pub id: String,
    /// host:port as reported to the coordinator.
    pub address: String,
    pub location: Location,
    pub coordinator_address: String,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub space_limit: u64,
    /// Chunk id -> in-flight 2PC state. The lock also serializes
    /// prepare/commit/rollback for a given chunk.
    pub transactions: Arc<Mutex<HashMap<String, ChunkTxn>>>,
    /// Committed bytes in the data directory, maintained across
    /// operations so requests need not rewalk the directory.
    pub used_bytes: Arc<Mutex<u64>>,
    pub config: StorageConfig,
}

impl StorageService {
    pub fn new(
        id: &str,
        address: &str,
        location: Location,
        coordinator_address: &str,
        data_dir: &Path,
        config: StorageConfig,
    ) -> Result<Self> {
        let tmp_dir = data_dir.join(".tmp");
        std::fs::create_dir_all(&tmp_dir).map_err(|e| {
            FsError::Config(format!(
                "cannot create data directory '{}': {}",
                tmp_dir.display(),
                e
            ))
        })?;

        let space_limit = config.space_limit_mb * 1024 * 1024;
        let used = walk_used_bytes(data_dir)?;
        info!(
            "storage server '{}' at {} with {} bytes used of {}",
            id, address, used, space_limit
        );

        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
            location,
            coordinator_address: coordinator_address.to_string(),
            data_dir: data_dir.to_path_buf(),
            tmp_dir,
            space_limit,
            transactions: Arc::new(Mutex::new(HashMap::new())),
            used_bytes: Arc::new(Mutex::new(used)),
            config,
        })
    }

    pub fn chunk_path(&self, chunk_id: &str) -> PathBuf {
        self.data_dir.join(chunk_id)
    }

    pub fn tmp_chunk_path(&self, chunk_id: &str) -> PathBuf {
        self.tmp_dir.join(chunk_id)
    }

    pub fn tmp_append_path(&self, chunk_id: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.append", chunk_id))
    }

    /// Free space counting both committed bytes and bytes reserved by
    /// prepared-but-uncommitted transactions.
    pub async fn free_bytes(&self) -> u64 {
        // Lock order: transaction table before the used-bytes counter,
        // matching the prepare path.
        let reserved: u64 = {
            let transactions = self.transactions.lock().await;
            transactions.values().map(|t| t.reserved_bytes()).sum()
        };
        let used = *self.used_bytes.lock().await;
        self.space_limit.saturating_sub(used + reserved)
    }

    /// Registers with the coordinator; retried by the heartbeat loop if
    /// the coordinator is down right now.
    pub async fn register_with_coordinator(&self) -> Result<()> {
        let request = CoordinatorRequest::RegisterStorageServer {
            id: self.id.clone(),
            address: self.address.clone(),
            location: self.location,
            space_limit: self.space_limit,
        };
        let deadline = Duration::from_secs(self.config.request_timeout);
        let reply: CoordinatorReply =
            wire::call(&self.coordinator_address, &request, deadline).await?;
        match reply {
            CoordinatorReply::Ack => Ok(()),
            CoordinatorReply::Error { code, message } => {
                Err(FsError::Remote { code, message })
            }
            other => Err(FsError::Framing(format!(
                "unexpected registration reply: {:?}",
                other
            ))),
        }
    }

    /// Periodic liveness/capacity report. Carries location and space
    /// limit so an expired record is re-created coordinator-side. A send
    /// failure is logged; the next tick resumes.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(service.config.heartbeat_interval));
            loop {
                ticker.tick().await;

                // Rewalk at heartbeat time to reconcile the cache.
                match walk_used_bytes(&service.data_dir) {
                    Ok(used) => {
                        let mut cached = service.used_bytes.lock().await;
                        *cached = used;
                    }
                    Err(e) => warn!("space walk failed: {}", e),
                }

                let used = *service.used_bytes.lock().await;
                let request = CoordinatorRequest::Heartbeat {
                    address: service.address.clone(),
                    used_bytes: used,
                    location: Some(service.location),
                    space_limit: Some(service.space_limit),
                };
                let deadline = Duration::from_secs(service.config.request_timeout);
                let reply: Result<CoordinatorReply> =
                    wire::call(&service.coordinator_address, &request, deadline).await;
                match reply {
                    Ok(CoordinatorReply::Ack) => {}
                    Ok(CoordinatorReply::Error { code, message }) => {
                        warn!("heartbeat rejected ({:?}): {}", code, message)
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to send heartbeat: {}", e),
                }
            }
        });
    }
}

/// Sum of committed chunk sizes: every file directly in the data
/// directory, excluding `.tmp/` and the identity document.
pub fn walk_used_bytes(data_dir: &Path) -> Result<u64> {
    let mut total = 0;
    for dir_entry in std::fs::read_dir(data_dir)? {
        let dir_entry = dir_entry?;
        let file_type = dir_entry.file_type()?;
        if file_type.is_dir() {
            continue;
        }
        if dir_entry.file_name() == "server_info.json" {
            continue;
        }
        total += dir_entry.metadata()?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn used_bytes_skip_tmp_and_identity() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        std::fs::write(dir.path().join("chunk-a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("chunk-b"), vec![0u8; 50]).unwrap();
        std::fs::write(dir.path().join(".tmp").join("chunk-c"), vec![0u8; 999]).unwrap();
        store_server_info(
            dir.path(),
            &ServerInfo {
                id: "s1".to_string(),
                port: 7100,
            },
        )
        .unwrap();

        assert_eq!(walk_used_bytes(dir.path()).unwrap(), 150);
    }

    #[test]
    fn server_info_round_trips() {
        let dir = TempDir::new().unwrap();
        assert!(load_server_info(dir.path()).unwrap().is_none());
        store_server_info(
            dir.path(),
            &ServerInfo {
                id: "s1".to_string(),
                port: 7142,
            },
        )
        .unwrap();
        let info = load_server_info(dir.path()).unwrap().unwrap();
        assert_eq!(info.id, "s1");
        assert_eq!(info.port, 7142);
    }

    #[tokio::test]
    async fn free_bytes_count_prepared_reservations() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            space_limit_mb: 1, // 1 MiB
            ..Default::default()
        };
        let service = StorageService::new(
            "s1",
            "127.0.0.1:7100",
            (0.0, 0.0),
            "127.0.0.1:7000",
            dir.path(),
            config,
        )
        .unwrap();

        assert_eq!(service.free_bytes().await, 1024 * 1024);
        service
            .transactions
            .lock()
            .await
            .insert("c1".to_string(), ChunkTxn::Prepared { len: 1000 });
        assert_eq!(service.free_bytes().await, 1024 * 1024 - 1000);
    }
}
