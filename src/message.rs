//! Wire message vocabulary shared by coordinator, storage servers and
//! clients, plus the coordinator-side metadata records they exchange.
//! Every message travels as one length-prefixed JSON frame (see `wire`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ErrorCode;

/// A node position on the flat 2D plane used for proximity scoring.
pub type Location = (f64, f64);

/// Coordinator-side record of one file. Persisted verbatim in
/// `metadata.json` and returned whole by `get_file_metadata`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub total_size: u64,
    /// Chunk ids in read order.
    pub chunk_ids: Vec<String>,
    /// Chunk id -> storage-server addresses that committed it.
    pub chunk_locations: HashMap<String, Vec<String>>,
    /// Chunk id -> live byte count within the chunk.
    pub chunk_offsets: HashMap<String, u64>,
    /// Tail pointer used by append.
    pub last_chunk_id: String,
    pub last_chunk_offset: u64,
    /// Chunk id -> additional replicas still wanted.
    #[serde(default)]
    pub pending_replication: HashMap<String, usize>,
}

impl FileEntry {
    /// Live byte count recorded for `chunk_id`, if any.
    pub fn chunk_size_of(&self, chunk_id: &str) -> Option<u64> {
        self.chunk_offsets.get(chunk_id).copied()
    }
}

/// A storage server as seen by placement: enough to rank it and dial it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerEndpoint {
    pub id: String,
    pub address: String,
    pub location: Location,
    pub space_limit: u64,
    pub used_bytes: u64,
}

impl ServerEndpoint {
    pub fn free_bytes(&self) -> u64 {
        self.space_limit.saturating_sub(self.used_bytes)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: String,
    pub total_size: u64,
    pub chunk_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub address: String,
    pub location: Location,
    /// "storage" or "client".
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub distance: f64,
}

/// Commands accepted on the coordinator's port.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    RegisterStorageServer {
        id: String,
        address: String,
        location: Location,
        space_limit: u64,
    },
    RegisterClient {
        id: String,
        location: Location,
    },
    /// Liveness + capacity refresh. Storage servers send their address;
    /// clients send their id with `used_bytes` 0. An unknown storage
    /// address carrying both optional fields is registered on the spot.
    Heartbeat {
        address: String,
        used_bytes: u64,
        location: Option<Location>,
        space_limit: Option<u64>,
    },
    GetChunkServers {
        client_id: String,
        needed_bytes: u64,
    },
    GetReplicaLocations {
        client_id: String,
        chunk_id: String,
        size: u64,
        exclude: Vec<String>,
    },
    AddFile {
        path: String,
        size: u64,
        chunk_ids: Vec<String>,
    },
    UpdateFileMetadata {
        path: String,
        chunk_id: String,
        locations: Vec<String>,
        size_delta: u64,
    },
    UpdateChunkOffset {
        path: String,
        chunk_id: String,
        new_offset: u64,
    },
    GetFileMetadata {
        path: String,
    },
    ListFiles {
        prefix: Option<String>,
    },
    GetGraphData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CoordinatorReply {
    Ack,
    ChunkServers {
        servers: Vec<ServerEndpoint>,
    },
    FileMetadata {
        path: String,
        entry: FileEntry,
    },
    FileList {
        files: Vec<FileSummary>,
    },
    GraphData {
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Commands accepted on a storage server's port. The `Prepare*` /
/// `Commit*` / `Rollback*` variants are the 2PC phases exchanged between
/// storage servers; clients normally drive only `StoreChunk`,
/// `AppendChunk` and `RetrieveChunk`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StorageRequest {
    StoreChunk {
        chunk_id: String,
        file_path: String,
        data: Vec<u8>,
        replica_servers: Vec<String>,
        client_id: String,
    },
    PrepareChunk {
        chunk_id: String,
        data: Vec<u8>,
    },
    CommitChunk {
        chunk_id: String,
    },
    RollbackChunk {
        chunk_id: String,
    },
    RetrieveChunk {
        chunk_id: String,
        offset: Option<u64>,
        length: Option<u64>,
    },
    AppendChunk {
        chunk_id: String,
        file_path: String,
        data: Vec<u8>,
        offset: u64,
        replica_servers: Vec<String>,
    },
    PrepareAppend {
        chunk_id: String,
        data: Vec<u8>,
        offset: u64,
    },
    CommitAppend {
        chunk_id: String,
    },
    RollbackAppend {
        chunk_id: String,
    },
    ReplicateChunk {
        chunk_id: String,
        targets: Vec<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum StorageReply {
    Ack,
    /// Outcome of a 2PC: the servers that committed the payload.
    Stored { committed: Vec<String> },
    Chunk { data: Vec<u8> },
    Appended { new_offset: u64 },
    Error { code: ErrorCode, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_tag_with_snake_case_names() {
        let req = CoordinatorRequest::GetChunkServers {
            client_id: "c1".to_string(),
            needed_bytes: 4096,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"command\":\"get_chunk_servers\""));

        let req = StorageRequest::CommitChunk {
            chunk_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"command\":\"commit_chunk\""));
    }

    #[test]
    fn file_entry_round_trips_through_json() {
        let mut entry = FileEntry {
            total_size: 1100,
            chunk_ids: vec!["c1".to_string(), "c2".to_string()],
            last_chunk_id: "c2".to_string(),
            last_chunk_offset: 76,
            ..Default::default()
        };
        entry
            .chunk_locations
            .insert("c1".to_string(), vec!["127.0.0.1:7100".to_string()]);
        entry.chunk_offsets.insert("c1".to_string(), 1024);
        entry.pending_replication.insert("c1".to_string(), 2);

        let json = serde_json::to_string(&entry).unwrap();
        let back: FileEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
