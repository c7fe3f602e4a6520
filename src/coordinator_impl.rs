//! Coordinator network front end: accept loop and per-connection command
//! dispatch over the framed protocol.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::coordinator_service::CoordinatorService;
use crate::error::{FsError, Result};
use crate::message::{CoordinatorReply, CoordinatorRequest};
use crate::wire;

/// Accepts connections until shutdown; each connection gets its own task
/// and runs concurrently with the control loops.
pub async fn serve(service: Arc<CoordinatorService>, listener: TcpListener) -> Result<()> {
    info!("coordinator listening on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = listener.accept().await?;
        if service.is_stopped() {
            return Ok(());
        }
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(service, socket).await {
                debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Serves request/response pairs on one connection until the peer closes.
async fn handle_connection(
    service: Arc<CoordinatorService>,
    mut socket: TcpStream,
) -> Result<()> {
    loop {
        let request: CoordinatorRequest = match wire::read_frame(&mut socket).await {
            Ok(request) => request,
            Err(FsError::Framing(_)) => return Ok(()), // peer hung up
            Err(e) => return Err(e),
        };
        let reply = dispatch(&service, request).await;
        wire::write_frame(&mut socket, &reply).await?;
    }
}

pub async fn dispatch(
    service: &Arc<CoordinatorService>,
    request: CoordinatorRequest,
) -> CoordinatorReply {
    let result = match request {
        CoordinatorRequest::RegisterStorageServer {
            id,
            address,
            location,
            space_limit,
        } => {
            let outcome = service
                .register_storage_server(&id, &address, location, space_limit)
                .await;
            if outcome.is_ok() {
                // A returning server may be the missing replica target for
                // queued deficits; scan without delaying the reply.
                let service = Arc::clone(service);
                tokio::spawn(async move { service.repair_tick().await });
            }
            outcome.map(|_| CoordinatorReply::Ack)
        }
        CoordinatorRequest::RegisterClient { id, location } => service
            .register_client(&id, location)
            .await
            .map(|_| CoordinatorReply::Ack),
        CoordinatorRequest::Heartbeat {
            address,
            used_bytes,
            location,
            space_limit,
        } => service
            .heartbeat(&address, used_bytes, location, space_limit)
            .await
            .map(|_| CoordinatorReply::Ack),
        CoordinatorRequest::GetChunkServers {
            client_id,
            needed_bytes,
        } => service
            .chunk_servers_for(&client_id, needed_bytes, &[])
            .await
            .map(|servers| CoordinatorReply::ChunkServers { servers }),
        CoordinatorRequest::GetReplicaLocations {
            client_id,
            chunk_id: _,
            size,
            exclude,
        } => service
            .chunk_servers_for(&client_id, size, &exclude)
            .await
            .map(|servers| CoordinatorReply::ChunkServers { servers }),
        CoordinatorRequest::AddFile {
            path,
            size,
            chunk_ids,
        } => service
            .add_file(&path, size, chunk_ids)
            .await
            .map(|_| CoordinatorReply::Ack),
        CoordinatorRequest::UpdateFileMetadata {
            path,
            chunk_id,
            locations,
            size_delta,
        } => service
            .update_file_metadata(&path, &chunk_id, locations, size_delta)
            .await
            .map(|_| CoordinatorReply::Ack),
        CoordinatorRequest::UpdateChunkOffset {
            path,
            chunk_id,
            new_offset,
        } => service
            .update_chunk_offset(&path, &chunk_id, new_offset)
            .await
            .map(|_| CoordinatorReply::Ack),
        CoordinatorRequest::GetFileMetadata { path } => service
            .get_file_metadata(&path)
            .await
            .map(|entry| CoordinatorReply::FileMetadata { path, entry }),
        CoordinatorRequest::ListFiles { prefix } => Ok(CoordinatorReply::FileList {
            files: service.list_files(prefix.as_deref()).await,
        }),
        CoordinatorRequest::GetGraphData => {
            let (nodes, edges) = service.graph_data().await;
            Ok(CoordinatorReply::GraphData { nodes, edges })
        }
    };

    match result {
        Ok(reply) => reply,
        Err(e) => CoordinatorReply::Error {
            code: e.code(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::error::ErrorCode;
    use tempfile::TempDir;
    use tokio::time::Duration;

    async fn spawn_coordinator(dir: &TempDir) -> (Arc<CoordinatorService>, String) {
        let config = CoordinatorConfig {
            metadata_dir: dir.path().display().to_string(),
            ..Default::default()
        };
        let service = Arc::new(CoordinatorService::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(Arc::clone(&service), listener));
        (service, address)
    }

    #[tokio::test]
    async fn register_and_query_over_the_wire() {
        let dir = TempDir::new().unwrap();
        let (_service, address) = spawn_coordinator(&dir).await;
        let deadline = Duration::from_secs(5);

        let reply: CoordinatorReply = wire::call(
            &address,
            &CoordinatorRequest::RegisterStorageServer {
                id: "s1".to_string(),
                address: "127.0.0.1:7101".to_string(),
                location: (0.0, 0.0),
                space_limit: 1024 * 1024 * 1024,
            },
            deadline,
        )
        .await
        .unwrap();
        assert!(matches!(reply, CoordinatorReply::Ack));

        let reply: CoordinatorReply = wire::call(
            &address,
            &CoordinatorRequest::RegisterClient {
                id: "c1".to_string(),
                location: (0.0, 0.0),
            },
            deadline,
        )
        .await
        .unwrap();
        assert!(matches!(reply, CoordinatorReply::Ack));

        let reply: CoordinatorReply = wire::call(
            &address,
            &CoordinatorRequest::GetChunkServers {
                client_id: "c1".to_string(),
                needed_bytes: 1024,
            },
            deadline,
        )
        .await
        .unwrap();
        match reply {
            CoordinatorReply::ChunkServers { servers } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].id, "s1");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_file_surfaces_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let (_service, address) = spawn_coordinator(&dir).await;

        let reply: CoordinatorReply = wire::call(
            &address,
            &CoordinatorRequest::GetFileMetadata {
                path: "/missing".to_string(),
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        match reply {
            CoordinatorReply::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownFile),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
