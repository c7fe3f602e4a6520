//! Client library: splits files into chunks, asks the coordinator for
//! placement, drives the two-phase writes against storage servers and
//! reassembles files on read.

use rand::Rng;
use std::path::Path;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ErrorCode, FsError, Result};
use crate::message::{
    CoordinatorReply, CoordinatorRequest, FileEntry, Location, ServerEndpoint, StorageReply,
    StorageRequest,
};
use crate::util::mint_chunk_id;
use crate::wire;

const MAX_ATTEMPTS: usize = 3;
const BASE_BACKOFF_MS: u64 = 200;

pub struct FsClient {
    pub id: String,
    pub location: Location,
    pub coordinator_address: String,
    pub config: ClientConfig,
}

impl FsClient {
    /// Registers with the coordinator and returns a ready client.
    pub async fn connect(
        id: &str,
        location: Location,
        coordinator_address: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let client = Self {
            id: id.to_string(),
            location,
            coordinator_address: coordinator_address.to_string(),
            config,
        };
        client
            .coordinator(&CoordinatorRequest::RegisterClient {
                id: client.id.clone(),
                location,
            })
            .await?;
        Ok(client)
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout)
    }

    async fn coordinator(&self, request: &CoordinatorRequest) -> Result<CoordinatorReply> {
        let reply: CoordinatorReply =
            wire::call(&self.coordinator_address, request, self.deadline()).await?;
        match reply {
            CoordinatorReply::Error { code, message } => Err(FsError::Remote { code, message }),
            other => Ok(other),
        }
    }

    /// Liveness refresh for long-running clients; one-shot CLI runs rely
    /// on the registration performed by `connect`.
    pub async fn heartbeat(&self) -> Result<()> {
        self.coordinator(&CoordinatorRequest::Heartbeat {
            address: self.id.clone(),
            used_bytes: 0,
            location: Some(self.location),
            space_limit: None,
        })
        .await
        .map(|_| ())
    }

    async fn placement(
        &self,
        chunk_id: &str,
        size: u64,
        exclude: &[String],
    ) -> Result<Vec<ServerEndpoint>> {
        let request = if exclude.is_empty() {
            CoordinatorRequest::GetChunkServers {
                client_id: self.id.clone(),
                needed_bytes: size,
            }
        } else {
            CoordinatorRequest::GetReplicaLocations {
                client_id: self.id.clone(),
                chunk_id: chunk_id.to_string(),
                size,
                exclude: exclude.to_vec(),
            }
        };
        match self.coordinator(&request).await? {
            CoordinatorReply::ChunkServers { servers } => Ok(servers),
            other => Err(FsError::Framing(format!(
                "unexpected placement reply: {:?}",
                other
            ))),
        }
    }

    pub async fn get_file_metadata(&self, remote_path: &str) -> Result<FileEntry> {
        match self
            .coordinator(&CoordinatorRequest::GetFileMetadata {
                path: remote_path.to_string(),
            })
            .await?
        {
            CoordinatorReply::FileMetadata { entry, .. } => Ok(entry),
            other => Err(FsError::Framing(format!(
                "unexpected metadata reply: {:?}",
                other
            ))),
        }
    }

    // ---- upload -------------------------------------------------------

    pub async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.upload_bytes(&data, remote_path).await
    }

    /// Splits into `upload_chunk_size` chunks (the last possibly short)
    /// and commits them in order. A failure after the first committed
    /// chunk surfaces as a partial failure; already committed chunks
    /// stay in place.
    pub async fn upload_bytes(&self, data: &[u8], remote_path: &str) -> Result<()> {
        let chunk_size = self.config.upload_chunk_size as usize;
        let pieces: Vec<&[u8]> = data.chunks(chunk_size).collect();
        info!(
            "uploading {} bytes to '{}' as {} chunk(s)",
            data.len(),
            remote_path,
            pieces.len()
        );

        let mut chunk_ids = Vec::with_capacity(pieces.len());
        let mut committed = 0usize;
        for (index, piece) in pieces.iter().enumerate() {
            let chunk_id = mint_chunk_id(remote_path, index);
            let outcome = self.store_one_chunk(remote_path, &chunk_id, piece).await;
            if let Err(e) = outcome {
                if committed > 0 {
                    return Err(FsError::PartialFailure {
                        committed_chunks: committed,
                        failed_chunk: chunk_id,
                    });
                }
                return Err(e);
            }
            chunk_ids.push(chunk_id);
            committed += 1;
        }

        // The per-chunk metadata updates populate the entry as commits
        // land; add_file covers the empty-file case and is otherwise a
        // no-op on the existing entry.
        self.coordinator(&CoordinatorRequest::AddFile {
            path: remote_path.to_string(),
            size: data.len() as u64,
            chunk_ids,
        })
        .await?;
        Ok(())
    }

    /// One chunk write: rank, 2PC via the top-ranked primary, report the
    /// committed set. Retries walk down the ranked set, then re-rank
    /// with exhausted servers excluded, with exponential backoff.
    async fn store_one_chunk(&self, remote_path: &str, chunk_id: &str, data: &[u8]) -> Result<()> {
        let mut exclude: Vec<String> = Vec::new();
        let mut last_error = FsError::NoServersAvailable {
            needed: data.len() as u64,
        };

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                self.backoff(attempt).await;
            }
            let servers = self
                .placement(chunk_id, data.len() as u64, &exclude)
                .await?;
            if servers.is_empty() {
                return Err(FsError::NoServersAvailable {
                    needed: data.len() as u64,
                });
            }

            for (primary_rank, primary) in servers.iter().enumerate() {
                let replicas: Vec<String> = servers
                    .iter()
                    .enumerate()
                    .filter(|(rank, _)| *rank != primary_rank)
                    .map(|(_, s)| s.address.clone())
                    .collect();
                let request = StorageRequest::StoreChunk {
                    chunk_id: chunk_id.to_string(),
                    file_path: remote_path.to_string(),
                    data: data.to_vec(),
                    replica_servers: replicas,
                    client_id: self.id.clone(),
                };
                let reply: Result<StorageReply> =
                    wire::call(&primary.address, &request, self.deadline()).await;
                match reply {
                    Ok(StorageReply::Stored { committed }) => {
                        self.coordinator(&CoordinatorRequest::UpdateFileMetadata {
                            path: remote_path.to_string(),
                            chunk_id: chunk_id.to_string(),
                            locations: committed,
                            size_delta: data.len() as u64,
                        })
                        .await?;
                        return Ok(());
                    }
                    Ok(StorageReply::Error { code, message }) => {
                        warn!(
                            "store of '{}' via {} failed ({:?}): {}",
                            chunk_id, primary.address, code, message
                        );
                        if code == ErrorCode::InsufficientSpace
                            && !exclude.contains(&primary.address)
                        {
                            exclude.push(primary.address.clone());
                        }
                        last_error = FsError::Remote { code, message };
                    }
                    Ok(other) => {
                        last_error = FsError::Framing(format!(
                            "unexpected store reply from {}: {:?}",
                            primary.address, other
                        ));
                    }
                    Err(e) => {
                        debug!("store of '{}' via {} failed: {}", chunk_id, primary.address, e);
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn backoff(&self, attempt: usize) {
        let base = BASE_BACKOFF_MS << (attempt - 1);
        let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }

    // ---- download -----------------------------------------------------

    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let data = self.download_bytes(remote_path).await?;
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    /// Fetches chunks in read order, preferring the holder the
    /// coordinator currently ranks highest for this client and falling
    /// back to any other live holder.
    pub async fn download_bytes(&self, remote_path: &str) -> Result<Vec<u8>> {
        let entry = self.get_file_metadata(remote_path).await?;
        let ranked = self.placement("", 0, &[]).await.unwrap_or_default();

        let mut out = Vec::with_capacity(entry.total_size as usize);
        for chunk_id in &entry.chunk_ids {
            let holders = entry
                .chunk_locations
                .get(chunk_id)
                .cloned()
                .unwrap_or_default();
            if holders.is_empty() {
                return Err(FsError::UnknownChunk(chunk_id.clone()));
            }

            // Ranked holders first, then the rest as fallback.
            let mut ordered: Vec<String> = ranked
                .iter()
                .map(|s| s.address.clone())
                .filter(|addr| holders.contains(addr))
                .collect();
            for holder in &holders {
                if !ordered.contains(holder) {
                    ordered.push(holder.clone());
                }
            }

            let live_bytes = entry.chunk_size_of(chunk_id);
            let mut chunk_data: Option<Vec<u8>> = None;
            for address in &ordered {
                let request = StorageRequest::RetrieveChunk {
                    chunk_id: chunk_id.clone(),
                    offset: None,
                    length: live_bytes,
                };
                let reply: Result<StorageReply> =
                    wire::call(address, &request, self.deadline()).await;
                match reply {
                    Ok(StorageReply::Chunk { data }) => {
                        chunk_data = Some(data);
                        break;
                    }
                    Ok(StorageReply::Error { message, .. }) => {
                        warn!("retrieve of '{}' from {} failed: {}", chunk_id, address, message)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("retrieve of '{}' from {} failed: {}", chunk_id, address, e),
                }
            }
            match chunk_data {
                Some(data) => out.extend_from_slice(&data),
                None => return Err(FsError::MissingChunkFile(chunk_id.clone())),
            }
        }
        Ok(out)
    }

    // ---- append -------------------------------------------------------

    /// Fills the tail chunk up to the chunk boundary, then spills the
    /// remainder into new chunks through the upload path. Retries on a
    /// stale-offset rejection, which means another appender won the
    /// race for the tail.
    pub async fn append(&self, remote_path: &str, data: &[u8]) -> Result<()> {
        let chunk_size = self.config.upload_chunk_size;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                self.backoff(attempt).await;
            }
            let entry = self.get_file_metadata(remote_path).await?;
            let tail_room = if entry.last_chunk_id.is_empty() {
                0
            } else {
                chunk_size.saturating_sub(entry.last_chunk_offset) as usize
            };
            let split = tail_room.min(data.len());
            let (head, rest) = data.split_at(split);

            if !head.is_empty() {
                match self.append_to_tail(remote_path, &entry, head).await {
                    Ok(()) => {}
                    Err(FsError::Remote {
                        code: ErrorCode::StaleOffset,
                        ..
                    }) => {
                        debug!("append lost the tail race on '{}', retrying", remote_path);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if !rest.is_empty() {
                let start_index = entry.chunk_ids.len();
                for (index, piece) in rest.chunks(chunk_size as usize).enumerate() {
                    let chunk_id = mint_chunk_id(remote_path, start_index + index);
                    self.store_one_chunk(remote_path, &chunk_id, piece).await?;
                }
            }
            return Ok(());
        }
        Err(FsError::Remote {
            code: ErrorCode::StaleOffset,
            message: format!("append to '{}' kept losing the tail race", remote_path),
        })
    }

    async fn append_to_tail(
        &self,
        remote_path: &str,
        entry: &FileEntry,
        data: &[u8],
    ) -> Result<()> {
        let tail_id = &entry.last_chunk_id;
        let holders = entry
            .chunk_locations
            .get(tail_id)
            .cloned()
            .unwrap_or_default();
        if holders.is_empty() {
            return Err(FsError::UnknownChunk(tail_id.clone()));
        }

        let mut last_error: Option<FsError> = None;
        for (index, primary) in holders.iter().enumerate() {
            let replicas: Vec<String> = holders
                .iter()
                .enumerate()
                .filter(|(rank, _)| *rank != index)
                .map(|(_, addr)| addr.clone())
                .collect();
            let request = StorageRequest::AppendChunk {
                chunk_id: tail_id.clone(),
                file_path: remote_path.to_string(),
                data: data.to_vec(),
                offset: entry.last_chunk_offset,
                replica_servers: replicas,
            };
            let reply: Result<StorageReply> =
                wire::call(primary.as_str(), &request, self.deadline()).await;
            match reply {
                Ok(StorageReply::Appended { .. }) => return Ok(()),
                Ok(StorageReply::Error { code, message }) => {
                    return Err(FsError::Remote { code, message })
                }
                Ok(other) => {
                    last_error = Some(FsError::Framing(format!(
                        "unexpected append reply: {:?}",
                        other
                    )))
                }
                Err(e) => {
                    warn!("append via {} failed: {}", primary, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(FsError::NoServersAvailable {
            needed: data.len() as u64,
        }))
    }
}
