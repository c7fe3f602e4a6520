//! Storage-server request handling: the chunk lifecycle
//! (prepare/commit/rollback), reads, the append phases, and the
//! primary-driven two-phase commit that fans writes out to replicas.

use futures::future::join_all;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FsError, Result};
use crate::message::{CoordinatorReply, CoordinatorRequest, StorageReply, StorageRequest};
use crate::storage_service::{ChunkTxn, StorageService};
use crate::wire;

pub async fn serve(service: Arc<StorageService>, listener: TcpListener) -> Result<()> {
    info!("storage server '{}' listening on {}", service.id, service.address);
    loop {
        let (socket, peer) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(service, socket).await {
                debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(service: Arc<StorageService>, mut socket: TcpStream) -> Result<()> {
    loop {
        let request: StorageRequest = match wire::read_frame(&mut socket).await {
            Ok(request) => request,
            Err(FsError::Framing(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let reply = dispatch(&service, request).await;
        wire::write_frame(&mut socket, &reply).await?;
    }
}

pub async fn dispatch(service: &Arc<StorageService>, request: StorageRequest) -> StorageReply {
    let result: Result<StorageReply> = match request {
        StorageRequest::StoreChunk {
            chunk_id,
            file_path: _,
            data,
            replica_servers,
            client_id: _,
        } => service
            .store_chunk(&chunk_id, &data, &replica_servers)
            .await
            .map(|committed| StorageReply::Stored { committed }),
        StorageRequest::PrepareChunk { chunk_id, data } => service
            .prepare_chunk(&chunk_id, &data)
            .await
            .map(|_| StorageReply::Ack),
        StorageRequest::CommitChunk { chunk_id } => service
            .commit_chunk(&chunk_id)
            .await
            .map(|_| StorageReply::Ack),
        StorageRequest::RollbackChunk { chunk_id } => service
            .rollback_chunk(&chunk_id)
            .await
            .map(|_| StorageReply::Ack),
        StorageRequest::RetrieveChunk {
            chunk_id,
            offset,
            length,
        } => service
            .retrieve_chunk(&chunk_id, offset, length)
            .await
            .map(|data| StorageReply::Chunk { data }),
        StorageRequest::AppendChunk {
            chunk_id,
            file_path,
            data,
            offset,
            replica_servers,
        } => service
            .append_chunk(&chunk_id, &file_path, &data, offset, &replica_servers)
            .await
            .map(|new_offset| StorageReply::Appended { new_offset }),
        StorageRequest::PrepareAppend {
            chunk_id,
            data,
            offset,
        } => service
            .prepare_append(&chunk_id, &data, offset)
            .await
            .map(|_| StorageReply::Ack),
        StorageRequest::CommitAppend { chunk_id } => service
            .commit_append(&chunk_id)
            .await
            .map(|new_offset| StorageReply::Appended { new_offset }),
        StorageRequest::RollbackAppend { chunk_id } => service
            .rollback_append(&chunk_id)
            .await
            .map(|_| StorageReply::Ack),
        StorageRequest::ReplicateChunk { chunk_id, targets } => service
            .replicate_chunk(&chunk_id, &targets)
            .await
            .map(|committed| StorageReply::Stored { committed }),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => StorageReply::Error {
            code: e.code(),
            message: e.to_string(),
        },
    }
}

impl StorageService {
    // ---- phase handlers -----------------------------------------------

    /// Phase 1: stage the payload in `.tmp/`. Idempotent against a chunk
    /// this server already committed.
    pub async fn prepare_chunk(&self, chunk_id: &str, data: &[u8]) -> Result<()> {
        let mut transactions = self.transactions.lock().await;

        if tokio::fs::try_exists(self.chunk_path(chunk_id))
            .await
            .unwrap_or(false)
        {
            debug!("prepare for committed chunk '{}', acking", chunk_id);
            return Ok(());
        }

        let needed = data.len() as u64;
        let used = *self.used_bytes.lock().await;
        let reserved: u64 = transactions
            .iter()
            .filter(|(id, _)| id.as_str() != chunk_id)
            .map(|(_, txn)| txn.reserved_bytes())
            .sum();
        let free = self.space_limit.saturating_sub(used + reserved);
        if free < needed {
            return Err(FsError::InsufficientSpace {
                server: self.address.clone(),
                needed,
                free,
            });
        }

        // Stage through a partial file so `.tmp/<chunk_id>` appears whole.
        let tmp_path = self.tmp_chunk_path(chunk_id);
        let partial = self.tmp_dir.join(format!("{}.partial", chunk_id));
        tokio::fs::write(&partial, data).await?;
        tokio::fs::rename(&partial, &tmp_path).await?;

        transactions.insert(chunk_id.to_string(), ChunkTxn::Prepared { len: needed });
        Ok(())
    }

    /// Phase 2: rename the staged payload into the data directory.
    /// Idempotent if the chunk is already committed.
    pub async fn commit_chunk(&self, chunk_id: &str) -> Result<()> {
        let mut transactions = self.transactions.lock().await;

        let final_path = self.chunk_path(chunk_id);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            transactions.remove(chunk_id);
            return Ok(());
        }

        let tmp_path = self.tmp_chunk_path(chunk_id);
        let len = match tokio::fs::metadata(&tmp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Err(FsError::CommitWithoutPrepare(chunk_id.to_string())),
        };
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let mut used = self.used_bytes.lock().await;
        *used += len;
        transactions.remove(chunk_id);
        Ok(())
    }

    /// Drops the staged payload, if any. Idempotent.
    pub async fn rollback_chunk(&self, chunk_id: &str) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        let tmp_path = self.tmp_chunk_path(chunk_id);
        match tokio::fs::remove_file(&tmp_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::Io(e)),
        }
        transactions.remove(chunk_id);
        Ok(())
    }

    pub async fn retrieve_chunk(
        &self,
        chunk_id: &str,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        let path = self.chunk_path(chunk_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::UnknownChunk(chunk_id.to_string()))
            }
            Err(e) => return Err(FsError::Io(e)),
        };
        let start = offset.unwrap_or(0).min(data.len() as u64) as usize;
        let end = match length {
            Some(len) => (start as u64 + len).min(data.len() as u64) as usize,
            None => data.len(),
        };
        Ok(data[start..end].to_vec())
    }

    /// Append phase 1: stage the tail bytes in `.tmp/<chunk_id>.append`.
    pub async fn prepare_append(&self, chunk_id: &str, data: &[u8], offset: u64) -> Result<()> {
        let mut transactions = self.transactions.lock().await;

        if !tokio::fs::try_exists(self.chunk_path(chunk_id))
            .await
            .unwrap_or(false)
        {
            return Err(FsError::UnknownChunk(chunk_id.to_string()));
        }

        let needed = data.len() as u64;
        let used = *self.used_bytes.lock().await;
        let reserved: u64 = transactions.values().map(|t| t.reserved_bytes()).sum();
        let free = self.space_limit.saturating_sub(used + reserved);
        if free < needed {
            return Err(FsError::InsufficientSpace {
                server: self.address.clone(),
                needed,
                free,
            });
        }

        let append_path = self.tmp_append_path(chunk_id);
        let partial = self.tmp_dir.join(format!("{}.append.partial", chunk_id));
        tokio::fs::write(&partial, data).await?;
        tokio::fs::rename(&partial, &append_path).await?;

        transactions.insert(
            chunk_id.to_string(),
            ChunkTxn::AppendPrepared {
                len: needed,
                offset,
            },
        );
        Ok(())
    }

    /// Append phase 2: splice the staged tail into the committed chunk
    /// at the prepared offset and fsync. Returns the new live offset.
    pub async fn commit_append(&self, chunk_id: &str) -> Result<u64> {
        let mut transactions = self.transactions.lock().await;
        let (len, offset) = match transactions.get(chunk_id) {
            Some(ChunkTxn::AppendPrepared { len, offset }) => (*len, *offset),
            _ => return Err(FsError::CommitWithoutPrepare(chunk_id.to_string())),
        };

        let append_path = self.tmp_append_path(chunk_id);
        let tail = tokio::fs::read(&append_path).await.map_err(|_| {
            FsError::CommitWithoutPrepare(chunk_id.to_string())
        })?;

        let chunk_path = self.chunk_path(chunk_id);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&chunk_path)
            .await
            .map_err(|_| FsError::MissingChunkFile(chunk_id.to_string()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&tail).await?;
        file.sync_all().await?;

        tokio::fs::remove_file(&append_path).await.ok();
        transactions.remove(chunk_id);

        let mut used = self.used_bytes.lock().await;
        *used += len;
        Ok(offset + len)
    }

    pub async fn rollback_append(&self, chunk_id: &str) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        match tokio::fs::remove_file(self.tmp_append_path(chunk_id)).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::Io(e)),
        }
        transactions.remove(chunk_id);
        Ok(())
    }

    // ---- two-phase commit, primary side -------------------------------

    /// Canonical write path. This server prepares locally, fans phase 1
    /// out to the replicas, then commits everywhere. Any prepare failure
    /// rolls the whole attempt back; a commit failure on a replica only
    /// shrinks the returned success set (the repair loop owns the
    /// deficit from there).
    pub async fn store_chunk(
        &self,
        chunk_id: &str,
        data: &[u8],
        replica_servers: &[String],
    ) -> Result<Vec<String>> {
        let deadline = Duration::from_secs(self.config.request_timeout);

        // Phase 1, local first: a primary that cannot hold the chunk
        // should fail before any replica stages bytes.
        self.prepare_chunk(chunk_id, data).await?;

        let prepare = StorageRequest::PrepareChunk {
            chunk_id: chunk_id.to_string(),
            data: data.to_vec(),
        };
        let outcomes = join_all(replica_servers.iter().map(|address| {
            let prepare = prepare.clone();
            async move {
                let reply: Result<StorageReply> = wire::call(address, &prepare, deadline).await;
                (address.clone(), reply)
            }
        }))
        .await;

        let mut prepared = Vec::new();
        let mut failure: Option<FsError> = None;
        for (address, outcome) in outcomes {
            match outcome {
                Ok(StorageReply::Ack) => prepared.push(address),
                Ok(StorageReply::Error { code, message }) => {
                    warn!("prepare of '{}' on {} failed: {}", chunk_id, address, message);
                    failure.get_or_insert(FsError::Remote { code, message });
                }
                Ok(other) => {
                    failure.get_or_insert(FsError::Framing(format!(
                        "unexpected prepare reply from {}: {:?}",
                        address, other
                    )));
                }
                Err(e) => {
                    warn!("prepare of '{}' on {} failed: {}", chunk_id, address, e);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(error) = failure {
            self.abort_store(chunk_id, &prepared, deadline).await;
            return Err(error);
        }

        // Phase 2, local first again.
        if let Err(e) = self.commit_chunk(chunk_id).await {
            self.abort_store(chunk_id, &prepared, deadline).await;
            return Err(e);
        }
        let mut committed = vec![self.address.clone()];
        committed.extend(self.commit_replicas(chunk_id, &prepared, deadline).await);
        Ok(committed)
    }

    async fn abort_store(&self, chunk_id: &str, prepared: &[String], deadline: Duration) {
        self.rollback_chunk(chunk_id).await.ok();
        let rollback = StorageRequest::RollbackChunk {
            chunk_id: chunk_id.to_string(),
        };
        join_all(prepared.iter().map(|address| {
            let rollback = rollback.clone();
            async move {
                let _: Result<StorageReply> = wire::call(address, &rollback, deadline).await;
            }
        }))
        .await;
    }

    async fn commit_replicas(
        &self,
        chunk_id: &str,
        prepared: &[String],
        deadline: Duration,
    ) -> Vec<String> {
        let commit = StorageRequest::CommitChunk {
            chunk_id: chunk_id.to_string(),
        };
        let outcomes = join_all(prepared.iter().map(|address| {
            let commit = commit.clone();
            async move {
                let reply: Result<StorageReply> = wire::call(address, &commit, deadline).await;
                (address.clone(), reply)
            }
        }))
        .await;

        let mut committed = Vec::new();
        for (address, outcome) in outcomes {
            match outcome {
                Ok(StorageReply::Ack) => committed.push(address),
                Ok(StorageReply::Error { message, .. }) => {
                    warn!("commit of '{}' on {} failed: {}", chunk_id, address, message)
                }
                Ok(_) => {}
                Err(e) => warn!("commit of '{}' on {} failed: {}", chunk_id, address, e),
            }
        }
        committed
    }

    /// Append write path: same 2PC shape over the append phases, then a
    /// single offset report to the coordinator on the primary's behalf.
    pub async fn append_chunk(
        &self,
        chunk_id: &str,
        file_path: &str,
        data: &[u8],
        offset: u64,
        replica_servers: &[String],
    ) -> Result<u64> {
        let deadline = Duration::from_secs(self.config.request_timeout);

        self.prepare_append(chunk_id, data, offset).await?;

        let prepare = StorageRequest::PrepareAppend {
            chunk_id: chunk_id.to_string(),
            data: data.to_vec(),
            offset,
        };
        let outcomes = join_all(replica_servers.iter().map(|address| {
            let prepare = prepare.clone();
            async move {
                let reply: Result<StorageReply> = wire::call(address, &prepare, deadline).await;
                (address.clone(), reply)
            }
        }))
        .await;

        let mut prepared = Vec::new();
        let mut failure: Option<FsError> = None;
        for (address, outcome) in outcomes {
            match outcome {
                Ok(StorageReply::Ack) => prepared.push(address),
                Ok(StorageReply::Error { code, message }) => {
                    failure.get_or_insert(FsError::Remote { code, message });
                }
                Ok(other) => {
                    failure.get_or_insert(FsError::Framing(format!(
                        "unexpected prepare reply from {}: {:?}",
                        address, other
                    )));
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(error) = failure {
            self.rollback_append(chunk_id).await.ok();
            let rollback = StorageRequest::RollbackAppend {
                chunk_id: chunk_id.to_string(),
            };
            join_all(prepared.iter().map(|address| {
                let rollback = rollback.clone();
                async move {
                    let _: Result<StorageReply> = wire::call(address, &rollback, deadline).await;
                }
            }))
            .await;
            return Err(error);
        }

        let new_offset = self.commit_append(chunk_id).await?;
        let commit = StorageRequest::CommitAppend {
            chunk_id: chunk_id.to_string(),
        };
        join_all(prepared.iter().map(|address| {
            let commit = commit.clone();
            async move {
                let reply: Result<StorageReply> = wire::call(address, &commit, deadline).await;
                if let Err(e) = reply {
                    warn!("append commit on {} failed: {}", address, e);
                }
            }
        }))
        .await;

        // Report the new tail on the callers' behalf; a stale-offset
        // rejection means another appender won the race and the caller
        // must re-read metadata.
        let update = CoordinatorRequest::UpdateChunkOffset {
            path: file_path.to_string(),
            chunk_id: chunk_id.to_string(),
            new_offset,
        };
        let reply: CoordinatorReply =
            wire::call(&self.coordinator_address, &update, deadline).await?;
        match reply {
            CoordinatorReply::Ack => Ok(new_offset),
            CoordinatorReply::Error { code, message } => Err(FsError::Remote { code, message }),
            other => Err(FsError::Framing(format!(
                "unexpected offset-update reply: {:?}",
                other
            ))),
        }
    }

    /// Source side of repair: push the local payload to each target with
    /// store-chunk semantics. This server is the source, not a member of
    /// the target set, so the returned set lists targets only.
    pub async fn replicate_chunk(
        &self,
        chunk_id: &str,
        targets: &[String],
    ) -> Result<Vec<String>> {
        let deadline = Duration::from_secs(self.config.request_timeout);
        let data = self.retrieve_chunk(chunk_id, None, None).await?;

        let prepare = StorageRequest::PrepareChunk {
            chunk_id: chunk_id.to_string(),
            data,
        };
        let outcomes = join_all(targets.iter().map(|address| {
            let prepare = prepare.clone();
            async move {
                let reply: Result<StorageReply> = wire::call(address, &prepare, deadline).await;
                (address.clone(), reply)
            }
        }))
        .await;

        let mut prepared = Vec::new();
        let mut failure: Option<FsError> = None;
        for (address, outcome) in outcomes {
            match outcome {
                Ok(StorageReply::Ack) => prepared.push(address),
                Ok(StorageReply::Error { code, message }) => {
                    failure.get_or_insert(FsError::Remote { code, message });
                }
                Ok(other) => {
                    failure.get_or_insert(FsError::Framing(format!(
                        "unexpected prepare reply from {}: {:?}",
                        address, other
                    )));
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(error) = failure {
            let rollback = StorageRequest::RollbackChunk {
                chunk_id: chunk_id.to_string(),
            };
            join_all(prepared.iter().map(|address| {
                let rollback = rollback.clone();
                async move {
                    let _: Result<StorageReply> = wire::call(address, &rollback, deadline).await;
                }
            }))
            .await;
            return Err(error);
        }

        let committed = self.commit_replicas(chunk_id, &prepared, deadline).await;
        info!(
            "replicated chunk '{}' to {:?} ({} of {} targets)",
            chunk_id,
            committed,
            committed.len(),
            targets.len()
        );
        Ok(committed)
    }
}
