//! Coordinator state and internal logic: the authoritative file-to-chunk
//! map, storage-server membership, the placement engine, metadata
//! persistence and the two background control loops (membership reaper,
//! replication repair worker).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{FsError, Result};
use crate::message::{
    FileEntry, FileSummary, GraphEdge, GraphNode, Location, ServerEndpoint, StorageReply,
    StorageRequest,
};
use crate::util::{euclidean_distance, now_secs};
use crate::wire;

#[derive(Clone, Debug)]
pub struct StorageServerRecord {
    pub id: String,
    pub address: String,
    pub location: Location,
    pub space_limit: u64,
    pub used_bytes: u64,
    pub last_seen: u64,
}

impl StorageServerRecord {
    pub fn free_bytes(&self) -> u64 {
        self.space_limit.saturating_sub(self.used_bytes)
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            id: self.id.clone(),
            address: self.address.clone(),
            location: self.location,
            space_limit: self.space_limit,
            used_bytes: self.used_bytes,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub id: String,
    pub location: Location,
    pub last_seen: u64,
    /// Addresses from the last ranking served to this client.
    pub ranked_cache: Vec<String>,
}

/// One item of repair work, snapshotted out of the metadata lock so the
/// replicate RPC runs with no lock held.
struct RepairItem {
    path: String,
    chunk_id: String,
    deficit: usize,
    holders: Vec<String>,
    size: u64,
}

pub struct CoordinatorService {
    /// File path -> entry. Guarded by one exclusive lock; persisted to
    /// disk on every mutation. Lock order: metadata before server table.
    pub metadata: Arc<RwLock<HashMap<String, FileEntry>>>,
    /// Storage-server address -> record. In-memory only.
    pub storage_servers: Arc<RwLock<HashMap<String, StorageServerRecord>>>,
    /// Client id -> record. In-memory only.
    pub clients: Arc<RwLock<HashMap<String, ClientRecord>>>,
    /// Pairwise node distances, keyed by ordered (low, high) node id.
    pub distances: Arc<RwLock<HashMap<(String, String), f64>>>,
    pub config: CoordinatorConfig,
    metadata_path: PathBuf,
    stop_flag: Arc<AtomicBool>,
}

impl CoordinatorService {
    /// Builds the service, recovering persisted metadata. A corrupt
    /// metadata file refuses to load; the operator must restore it.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.metadata_dir).map_err(|e| {
            FsError::Config(format!(
                "cannot create metadata directory '{}': {}",
                config.metadata_dir, e
            ))
        })?;
        let metadata_path = PathBuf::from(&config.metadata_dir).join("metadata.json");

        let metadata = match std::fs::read(&metadata_path) {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, FileEntry>>(&bytes).map_err(
                |e| FsError::CorruptMetadata {
                    path: metadata_path.display().to_string(),
                    reason: e.to_string(),
                },
            )?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(FsError::Io(e)),
        };
        info!(
            "coordinator recovered {} file entr(ies) from {}",
            metadata.len(),
            metadata_path.display()
        );

        Ok(Self {
            metadata: Arc::new(RwLock::new(metadata)),
            storage_servers: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            distances: Arc::new(RwLock::new(HashMap::new())),
            config,
            metadata_path,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn expiry_secs(&self) -> u64 {
        self.config.heartbeat_failure_threshold * self.config.heartbeat_interval
    }

    /// Serializes the whole file-entry map, temp file then rename so the
    /// on-disk document is always a complete JSON object. Callers hold
    /// the metadata lock.
    async fn persist(&self, metadata: &HashMap<String, FileEntry>) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        let tmp = self.metadata_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.metadata_path).await?;
        Ok(())
    }

    // ---- location graph ------------------------------------------------

    async fn graph_add_node(&self, id: &str, location: Location) {
        let mut known: Vec<(String, Location)> = Vec::new();
        {
            let servers = self.storage_servers.read().await;
            known.extend(servers.values().map(|s| (s.id.clone(), s.location)));
        }
        {
            let clients = self.clients.read().await;
            known.extend(clients.values().map(|c| (c.id.clone(), c.location)));
        }
        let mut distances = self.distances.write().await;
        for (other_id, other_loc) in known {
            if other_id == id {
                continue;
            }
            let key = ordered_pair(id, &other_id);
            distances.insert(key, euclidean_distance(location, other_loc));
        }
    }

    async fn graph_remove_node(&self, id: &str) {
        let mut distances = self.distances.write().await;
        distances.retain(|(a, b), _| a != id && b != id);
    }

    // ---- membership ----------------------------------------------------

    /// Idempotent: repeated registration with the same address refreshes
    /// the record in place.
    pub async fn register_storage_server(
        &self,
        id: &str,
        address: &str,
        location: Location,
        space_limit: u64,
    ) -> Result<()> {
        {
            let mut servers = self.storage_servers.write().await;
            let record = servers
                .entry(address.to_string())
                .or_insert_with(|| StorageServerRecord {
                    id: id.to_string(),
                    address: address.to_string(),
                    location,
                    space_limit,
                    used_bytes: 0,
                    last_seen: 0,
                });
            record.id = id.to_string();
            record.location = location;
            record.space_limit = space_limit;
            record.last_seen = now_secs();
        }
        self.graph_add_node(id, location).await;
        info!("registered storage server '{}' at {}", id, address);
        Ok(())
    }

    pub async fn register_client(&self, id: &str, location: Location) -> Result<()> {
        {
            let mut clients = self.clients.write().await;
            let record = clients.entry(id.to_string()).or_insert_with(|| ClientRecord {
                id: id.to_string(),
                location,
                last_seen: 0,
                ranked_cache: Vec::new(),
            });
            record.location = location;
            record.last_seen = now_secs();
        }
        self.graph_add_node(id, location).await;
        info!("registered client '{}'", id);
        Ok(())
    }

    /// Refreshes liveness and capacity. An unknown storage address that
    /// carries location and space limit is registered on the spot, which
    /// is how a server recovers after its record expired here.
    pub async fn heartbeat(
        &self,
        address: &str,
        used_bytes: u64,
        location: Option<Location>,
        space_limit: Option<u64>,
    ) -> Result<()> {
        {
            let mut servers = self.storage_servers.write().await;
            if let Some(record) = servers.get_mut(address) {
                record.last_seen = now_secs();
                record.used_bytes = used_bytes;
                if let Some(loc) = location {
                    record.location = loc;
                }
                return Ok(());
            }
        }
        {
            let mut clients = self.clients.write().await;
            if let Some(record) = clients.get_mut(address) {
                record.last_seen = now_secs();
                if let Some(loc) = location {
                    record.location = loc;
                }
                return Ok(());
            }
        }
        match (location, space_limit) {
            (Some(loc), Some(limit)) => {
                info!("heartbeat from unknown server {}, re-registering", address);
                self.register_storage_server(address, address, loc, limit)
                    .await?;
                let mut servers = self.storage_servers.write().await;
                if let Some(record) = servers.get_mut(address) {
                    record.used_bytes = used_bytes;
                }
                Ok(())
            }
            _ => {
                warn!("heartbeat from unknown node '{}' dropped", address);
                Err(FsError::Remote {
                    code: crate::error::ErrorCode::BadRequest,
                    message: format!("unknown node '{}'", address),
                })
            }
        }
    }

    // ---- placement -----------------------------------------------------

    /// Ranks live, eligible storage servers by the weighted score of
    /// normalized distance from `origin` and space utilization; smaller
    /// is better, ties broken by server id. Returns at most
    /// `replication_factor` endpoints.
    pub async fn rank_servers(
        &self,
        origin: Location,
        needed_bytes: u64,
        exclude: &[String],
    ) -> Vec<ServerEndpoint> {
        let now = now_secs();
        let expiry = self.expiry_secs();
        let w_dist = self.config.distance_weight;
        let w_space = self.config.space_weight;

        let servers = self.storage_servers.read().await;
        let candidates: Vec<&StorageServerRecord> = servers
            .values()
            .filter(|s| now.saturating_sub(s.last_seen) <= expiry)
            .filter(|s| s.free_bytes() >= needed_bytes)
            .filter(|s| !exclude.contains(&s.address))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let max_distance = candidates
            .iter()
            .map(|s| euclidean_distance(origin, s.location))
            .fold(0.0_f64, f64::max);
        let max_distance = if max_distance > 0.0 { max_distance } else { 1.0 };

        let mut scored: Vec<(f64, ServerEndpoint)> = candidates
            .into_iter()
            .map(|s| {
                let normalized_distance =
                    euclidean_distance(origin, s.location) / max_distance;
                let space_utilization = if s.space_limit > 0 {
                    1.0 - (s.free_bytes() as f64 / s.space_limit as f64)
                } else {
                    1.0
                };
                let score = w_dist * normalized_distance + w_space * space_utilization;
                (score, s.endpoint())
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        scored
            .into_iter()
            .take(self.config.replication_factor)
            .map(|(_, endpoint)| endpoint)
            .collect()
    }

    /// Placement for a client request; also refreshes the client's
    /// cached ranking.
    pub async fn chunk_servers_for(
        &self,
        client_id: &str,
        needed_bytes: u64,
        exclude: &[String],
    ) -> Result<Vec<ServerEndpoint>> {
        let origin = {
            let clients = self.clients.read().await;
            clients
                .get(client_id)
                .map(|c| c.location)
                .ok_or_else(|| FsError::Remote {
                    code: crate::error::ErrorCode::BadRequest,
                    message: format!("unknown client '{}'", client_id),
                })?
        };
        let ranked = self.rank_servers(origin, needed_bytes, exclude).await;
        {
            let mut clients = self.clients.write().await;
            if let Some(record) = clients.get_mut(client_id) {
                record.ranked_cache = ranked.iter().map(|s| s.address.clone()).collect();
            }
        }
        Ok(ranked)
    }

    // ---- file metadata commands ---------------------------------------

    /// Initializes a file entry. Idempotent on an existing path.
    pub async fn add_file(&self, path: &str, size: u64, chunk_ids: Vec<String>) -> Result<()> {
        let mut metadata = self.metadata.write().await;
        if metadata.contains_key(path) {
            debug!("add_file: '{}' already present", path);
            return Ok(());
        }
        let entry = FileEntry {
            total_size: 0,
            last_chunk_id: chunk_ids.last().cloned().unwrap_or_default(),
            chunk_ids,
            ..Default::default()
        };
        info!("add_file '{}' (expected {} bytes)", path, size);
        metadata.insert(path.to_string(), entry);
        self.persist(&metadata).await
    }

    /// Installs the committed replica set for a chunk after a successful
    /// two-phase write and grows the file's byte accounting.
    pub async fn update_file_metadata(
        &self,
        path: &str,
        chunk_id: &str,
        locations: Vec<String>,
        size_delta: u64,
    ) -> Result<()> {
        let replication_factor = self.config.replication_factor;
        let mut metadata = self.metadata.write().await;
        let entry = metadata
            .entry(path.to_string())
            .or_insert_with(FileEntry::default);

        if !entry.chunk_ids.iter().any(|c| c == chunk_id) {
            entry.chunk_ids.push(chunk_id.to_string());
        }
        let deficit = replication_factor.saturating_sub(locations.len());
        if deficit > 0 {
            entry
                .pending_replication
                .insert(chunk_id.to_string(), deficit);
        } else {
            entry.pending_replication.remove(chunk_id);
        }
        entry.chunk_locations.insert(chunk_id.to_string(), locations);
        if size_delta > 0 || !entry.chunk_offsets.contains_key(chunk_id) {
            entry.chunk_offsets.insert(chunk_id.to_string(), size_delta);
        }
        entry.total_size += size_delta;
        entry.last_chunk_id = chunk_id.to_string();
        entry.last_chunk_offset = entry.chunk_size_of(chunk_id).unwrap_or(0);

        self.persist(&metadata).await
    }

    /// Append-path offset bump. Rejects non-monotonic offsets so two
    /// clients racing on the same tail chunk serialize: the loser gets a
    /// stale-offset error and retries against fresh metadata.
    pub async fn update_chunk_offset(
        &self,
        path: &str,
        chunk_id: &str,
        new_offset: u64,
    ) -> Result<()> {
        let mut metadata = self.metadata.write().await;
        let entry = metadata
            .get_mut(path)
            .ok_or_else(|| FsError::UnknownFile(path.to_string()))?;
        let current = entry
            .chunk_size_of(chunk_id)
            .ok_or_else(|| FsError::UnknownChunk(chunk_id.to_string()))?;
        if new_offset <= current {
            return Err(FsError::StaleOffset {
                chunk_id: chunk_id.to_string(),
                proposed: new_offset,
                current,
            });
        }
        entry.total_size += new_offset - current;
        entry.chunk_offsets.insert(chunk_id.to_string(), new_offset);
        if entry.last_chunk_id == chunk_id {
            entry.last_chunk_offset = new_offset;
        }
        self.persist(&metadata).await
    }

    pub async fn get_file_metadata(&self, path: &str) -> Result<FileEntry> {
        let metadata = self.metadata.read().await;
        metadata
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::UnknownFile(path.to_string()))
    }

    pub async fn list_files(&self, prefix: Option<&str>) -> Vec<FileSummary> {
        let metadata = self.metadata.read().await;
        let mut files: Vec<FileSummary> = metadata
            .iter()
            .filter(|(path, _)| prefix.map_or(true, |p| path.starts_with(p)))
            .map(|(path, entry)| FileSummary {
                path: path.clone(),
                total_size: entry.total_size,
                chunk_count: entry.chunk_ids.len(),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    pub async fn graph_data(&self) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let mut nodes = Vec::new();
        {
            let servers = self.storage_servers.read().await;
            nodes.extend(servers.values().map(|s| GraphNode {
                id: s.id.clone(),
                address: s.address.clone(),
                location: s.location,
                kind: "storage".to_string(),
            }));
        }
        {
            let clients = self.clients.read().await;
            nodes.extend(clients.values().map(|c| GraphNode {
                id: c.id.clone(),
                address: c.id.clone(),
                location: c.location,
                kind: "client".to_string(),
            }));
        }
        let distances = self.distances.read().await;
        let edges = distances
            .iter()
            .map(|((a, b), d)| GraphEdge {
                from: a.clone(),
                to: b.clone(),
                distance: *d,
            })
            .collect();
        (nodes, edges)
    }

    // ---- control loop #1: membership reaper ---------------------------

    /// Removes storage servers whose heartbeat went silent, strips them
    /// from every chunk's location set and enqueues replication deficits
    /// for the repair worker.
    pub async fn reap_expired_servers(&self) -> Vec<String> {
        let now = now_secs();
        let expiry = self.expiry_secs();

        let expired: Vec<String> = {
            let servers = self.storage_servers.read().await;
            servers
                .values()
                .filter(|s| now.saturating_sub(s.last_seen) > expiry)
                .map(|s| s.address.clone())
                .collect()
        };
        if expired.is_empty() {
            return expired;
        }
        warn!("storage servers expired: {:?}", expired);

        let replication_factor = self.config.replication_factor;
        {
            let mut metadata = self.metadata.write().await;
            let mut dirty = false;
            for entry in metadata.values_mut() {
                for chunk_id in entry.chunk_ids.clone() {
                    let remaining = match entry.chunk_locations.get_mut(&chunk_id) {
                        Some(locations) => {
                            let before = locations.len();
                            locations.retain(|addr| !expired.contains(addr));
                            if locations.len() == before {
                                continue;
                            }
                            dirty = true;
                            locations.len()
                        }
                        None => continue,
                    };
                    let deficit = replication_factor.saturating_sub(remaining);
                    if deficit > 0 {
                        entry.pending_replication.insert(chunk_id.clone(), deficit);
                    }
                }
            }
            if dirty {
                if let Err(e) = self.persist(&metadata).await {
                    error!("failed to persist metadata after reaping: {}", e);
                }
            }
        }

        let removed_ids: Vec<String> = {
            let mut servers = self.storage_servers.write().await;
            expired
                .iter()
                .filter_map(|address| servers.remove(address).map(|record| record.id))
                .collect()
        };
        for id in &removed_ids {
            self.graph_remove_node(id).await;
        }
        expired
    }

    pub fn start_membership_reaper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                if service.is_stopped() {
                    break;
                }
                service.reap_expired_servers().await;
            }
        });
    }

    // ---- control loop #2: replication repair worker -------------------

    /// One repair pass: for every chunk with a positive deficit, pick a
    /// live holder as source and ask it to push the payload to freshly
    /// ranked targets. Work is snapshotted first so no RPC runs under
    /// the metadata lock. Idempotent on chunks already at target count.
    pub async fn repair_tick(&self) {
        let work: Vec<RepairItem> = {
            let metadata = self.metadata.read().await;
            metadata
                .iter()
                .flat_map(|(path, entry)| {
                    entry
                        .pending_replication
                        .iter()
                        .filter(|(_, deficit)| **deficit > 0)
                        .map(|(chunk_id, deficit)| RepairItem {
                            path: path.clone(),
                            chunk_id: chunk_id.clone(),
                            deficit: *deficit,
                            holders: entry
                                .chunk_locations
                                .get(chunk_id)
                                .cloned()
                                .unwrap_or_default(),
                            size: entry
                                .chunk_size_of(chunk_id)
                                .unwrap_or(self.config.chunk_size),
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for item in work {
            if item.holders.is_empty() {
                error!(
                    "chunk '{}' of '{}' has no live holders; data lost, cannot repair",
                    item.chunk_id, item.path
                );
                continue;
            }

            // Rank targets from the source holder's position.
            let source = item.holders[0].clone();
            let origin = {
                let servers = self.storage_servers.read().await;
                match servers.get(&source) {
                    Some(record) => record.location,
                    None => continue, // holder expired since the snapshot
                }
            };
            let candidates = self
                .rank_servers(origin, item.size, &item.holders)
                .await;
            let targets: Vec<String> = candidates
                .into_iter()
                .take(item.deficit)
                .map(|s| s.address)
                .collect();
            if targets.is_empty() {
                debug!(
                    "no eligible targets for chunk '{}' (deficit {})",
                    item.chunk_id, item.deficit
                );
                continue;
            }

            info!(
                "repairing chunk '{}' of '{}': {} -> {:?}",
                item.chunk_id, item.path, source, targets
            );
            let request = StorageRequest::ReplicateChunk {
                chunk_id: item.chunk_id.clone(),
                targets: targets.clone(),
            };
            let deadline = Duration::from_secs(self.config.request_timeout);
            let reply: Result<StorageReply> = wire::call(&source, &request, deadline).await;

            match reply {
                Ok(StorageReply::Stored { committed }) if !committed.is_empty() => {
                    self.apply_repair(&item.path, &item.chunk_id, &committed)
                        .await;
                }
                Ok(StorageReply::Error { code, message }) => {
                    warn!(
                        "replicate of '{}' via {} failed ({:?}): {}",
                        item.chunk_id, source, code, message
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("replicate of '{}' via {} failed: {}", item.chunk_id, source, e);
                }
            }
        }
    }

    async fn apply_repair(&self, path: &str, chunk_id: &str, committed: &[String]) {
        let replication_factor = self.config.replication_factor;
        let mut metadata = self.metadata.write().await;
        if let Some(entry) = metadata.get_mut(path) {
            let locations = entry
                .chunk_locations
                .entry(chunk_id.to_string())
                .or_default();
            for address in committed {
                if !locations.contains(address) {
                    locations.push(address.clone());
                }
            }
            let deficit = replication_factor.saturating_sub(locations.len());
            if deficit > 0 {
                entry
                    .pending_replication
                    .insert(chunk_id.to_string(), deficit);
            } else {
                entry.pending_replication.remove(chunk_id);
            }
            if let Err(e) = self.persist(&metadata).await {
                error!("failed to persist metadata after repair: {}", e);
            }
        }
    }

    pub fn start_replication_worker(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let interval = self.config.cron_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                if service.is_stopped() {
                    break;
                }
                service.repair_tick().await;
            }
        });
    }
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn test_config(dir: &TempDir) -> CoordinatorConfig {
        CoordinatorConfig {
            metadata_dir: dir.path().display().to_string(),
            ..Default::default()
        }
    }

    async fn service_with_three_servers(dir: &TempDir) -> CoordinatorService {
        let service = CoordinatorService::new(test_config(dir)).unwrap();
        service
            .register_storage_server("s-origin", "127.0.0.1:7101", (0.0, 0.0), 1024 * MIB)
            .await
            .unwrap();
        service
            .register_storage_server("s-east", "127.0.0.1:7102", (100.0, 0.0), 1024 * MIB)
            .await
            .unwrap();
        service
            .register_storage_server("s-north", "127.0.0.1:7103", (0.0, 100.0), 1024 * MIB)
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn ranking_prefers_the_nearest_empty_server() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;

        let ranked = service.rank_servers((5.0, 5.0), MIB, &[]).await;
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].id, "s-origin");
    }

    #[tokio::test]
    async fn ranking_flips_when_the_near_server_fills_up() {
        let dir = TempDir::new().unwrap();
        // Space-heavy weights so utilization outweighs proximity.
        let config = CoordinatorConfig {
            metadata_dir: dir.path().display().to_string(),
            distance_weight: 0.2,
            space_weight: 0.8,
            ..Default::default()
        };
        let service = CoordinatorService::new(config).unwrap();
        service
            .register_storage_server("s-origin", "127.0.0.1:7101", (0.0, 0.0), 1024 * MIB)
            .await
            .unwrap();
        service
            .register_storage_server("s-east", "127.0.0.1:7102", (100.0, 0.0), 1024 * MIB)
            .await
            .unwrap();

        let ranked = service.rank_servers((5.0, 5.0), MIB, &[]).await;
        assert_eq!(ranked[0].id, "s-origin");

        // 90% used on the near server: the space term now dominates.
        service
            .heartbeat("127.0.0.1:7101", 922 * MIB, None, None)
            .await
            .unwrap();

        let ranked = service.rank_servers((5.0, 5.0), MIB, &[]).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "s-east");
    }

    #[tokio::test]
    async fn ranking_skips_servers_without_space() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;
        service
            .heartbeat("127.0.0.1:7101", 1024 * MIB, None, None)
            .await
            .unwrap();

        let ranked = service.rank_servers((5.0, 5.0), MIB, &[]).await;
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|s| s.id != "s-origin"));
    }

    #[tokio::test]
    async fn ranking_honors_exclusions() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;
        let ranked = service
            .rank_servers((5.0, 5.0), MIB, &["127.0.0.1:7101".to_string()])
            .await;
        assert!(ranked.iter().all(|s| s.address != "127.0.0.1:7101"));
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let service = CoordinatorService::new(test_config(&dir)).unwrap();
        for _ in 0..3 {
            service
                .register_storage_server("s1", "127.0.0.1:7101", (0.0, 0.0), 1024 * MIB)
                .await
                .unwrap();
        }
        assert_eq!(service.storage_servers.read().await.len(), 1);
    }

    #[tokio::test]
    async fn reaper_strips_locations_and_enqueues_deficit() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;

        service
            .add_file("/r/a.txt", MIB, vec!["c1".to_string()])
            .await
            .unwrap();
        service
            .update_file_metadata(
                "/r/a.txt",
                "c1",
                vec![
                    "127.0.0.1:7101".to_string(),
                    "127.0.0.1:7102".to_string(),
                    "127.0.0.1:7103".to_string(),
                ],
                MIB,
            )
            .await
            .unwrap();

        // Age one server past the expiry threshold.
        {
            let mut servers = service.storage_servers.write().await;
            servers.get_mut("127.0.0.1:7102").unwrap().last_seen = 1;
        }
        let expired = service.reap_expired_servers().await;
        assert_eq!(expired, vec!["127.0.0.1:7102".to_string()]);

        let entry = service.get_file_metadata("/r/a.txt").await.unwrap();
        let locations = &entry.chunk_locations["c1"];
        assert_eq!(locations.len(), 2);
        assert!(!locations.contains(&"127.0.0.1:7102".to_string()));
        assert_eq!(entry.pending_replication["c1"], 1);
        assert!(!service
            .storage_servers
            .read()
            .await
            .contains_key("127.0.0.1:7102"));
    }

    #[tokio::test]
    async fn expired_server_is_not_placed_before_the_reaper_runs() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;
        {
            let mut servers = service.storage_servers.write().await;
            servers.get_mut("127.0.0.1:7101").unwrap().last_seen = 1;
        }
        // No reap yet; ranking must already skip the silent server.
        let ranked = service.rank_servers((0.0, 0.0), MIB, &[]).await;
        assert!(ranked.iter().all(|s| s.address != "127.0.0.1:7101"));
    }

    #[tokio::test]
    async fn stale_offset_updates_are_rejected() {
        let dir = TempDir::new().unwrap();
        let service = CoordinatorService::new(test_config(&dir)).unwrap();
        service
            .add_file("/r/a.txt", 1000, vec!["c1".to_string()])
            .await
            .unwrap();
        service
            .update_file_metadata("/r/a.txt", "c1", vec!["127.0.0.1:7101".to_string()], 1000)
            .await
            .unwrap();

        service
            .update_chunk_offset("/r/a.txt", "c1", 1024)
            .await
            .unwrap();
        let result = service.update_chunk_offset("/r/a.txt", "c1", 1024).await;
        assert!(matches!(result, Err(FsError::StaleOffset { .. })));
        let result = service.update_chunk_offset("/r/a.txt", "c1", 512).await;
        assert!(matches!(result, Err(FsError::StaleOffset { .. })));

        let entry = service.get_file_metadata("/r/a.txt").await.unwrap();
        assert_eq!(entry.chunk_offsets["c1"], 1024);
        assert_eq!(entry.total_size, 1024);
    }

    #[tokio::test]
    async fn metadata_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let service = CoordinatorService::new(test_config(&dir)).unwrap();
            service
                .add_file("/r/a.txt", MIB, vec!["c1".to_string()])
                .await
                .unwrap();
            service
                .update_file_metadata("/r/a.txt", "c1", vec!["127.0.0.1:7101".to_string()], MIB)
                .await
                .unwrap();
        }
        let service = CoordinatorService::new(test_config(&dir)).unwrap();
        let entry = service.get_file_metadata("/r/a.txt").await.unwrap();
        assert_eq!(entry.total_size, MIB);
        assert_eq!(entry.chunk_ids, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_metadata_refuses_to_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("metadata.json"), b"{ not json").unwrap();
        let result = CoordinatorService::new(test_config(&dir));
        assert!(matches!(result, Err(FsError::CorruptMetadata { .. })));
    }

    #[tokio::test]
    async fn list_files_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let service = CoordinatorService::new(test_config(&dir)).unwrap();
        service
            .add_file("/logs/a", 1, vec!["c1".to_string()])
            .await
            .unwrap();
        service
            .add_file("/logs/b", 1, vec!["c2".to_string()])
            .await
            .unwrap();
        service
            .add_file("/data/c", 1, vec!["c3".to_string()])
            .await
            .unwrap();

        assert_eq!(service.list_files(None).await.len(), 3);
        let logs = service.list_files(Some("/logs/")).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].path, "/logs/a");
    }

    #[tokio::test]
    async fn graph_tracks_node_pairs_across_membership() {
        let dir = TempDir::new().unwrap();
        let service = service_with_three_servers(&dir).await;
        service.register_client("c1", (5.0, 5.0)).await.unwrap();

        let (nodes, edges) = service.graph_data().await;
        assert_eq!(nodes.len(), 4);
        // Every registered pair has one edge.
        assert_eq!(edges.len(), 6);

        {
            let mut servers = service.storage_servers.write().await;
            servers.get_mut("127.0.0.1:7103").unwrap().last_seen = 1;
        }
        service.reap_expired_servers().await;
        let (nodes, edges) = service.graph_data().await;
        assert_eq!(nodes.len(), 3);
        assert!(edges.iter().all(|e| e.from != "s-north" && e.to != "s-north"));
    }

    #[tokio::test]
    async fn update_file_metadata_tracks_replica_deficits() {
        let dir = TempDir::new().unwrap();
        let service = CoordinatorService::new(test_config(&dir)).unwrap();
        service
            .add_file("/r/big.bin", 10 * MIB, vec!["c1".to_string()])
            .await
            .unwrap();
        // Only one replica committed against a factor of three.
        service
            .update_file_metadata("/r/big.bin", "c1", vec!["127.0.0.1:7101".to_string()], 10 * MIB)
            .await
            .unwrap();
        let entry = service.get_file_metadata("/r/big.bin").await.unwrap();
        assert_eq!(entry.pending_replication["c1"], 2);
    }
}
