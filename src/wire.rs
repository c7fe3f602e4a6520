//! Length-prefixed framing: every message on every socket is
//! `u32 big-endian length || JSON payload`. Reads loop until the full
//! payload is consumed; EOF before that is a framing error.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::{FsError, Result};

/// Length field is an unsigned 32-bit, so frames top out at 4 GiB.
pub const MAX_FRAME_LEN: u64 = u32::MAX as u64;

pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u64 > MAX_FRAME_LEN {
        return Err(FsError::Framing(format!(
            "payload of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            FsError::Framing("connection closed before the length prefix".to_string())
        } else {
            FsError::Io(e)
        }
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            FsError::Framing(format!("connection closed inside a {}-byte payload", len))
        } else {
            FsError::Io(e)
        }
    })?;

    Ok(serde_json::from_slice(&payload)?)
}

/// One request/response exchange against `address` under a deadline.
/// Connect, send one frame, read one frame. Timeouts surface as
/// `DeadlineExceeded` so 2PC callers can treat them as replica failures.
pub async fn call<Req, Resp>(address: &str, request: &Req, deadline: Duration) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let exchange = async {
        let mut stream = TcpStream::connect(address).await?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    };
    match timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(FsError::DeadlineExceeded(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{StorageReply, StorageRequest};

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let sent = StorageRequest::PrepareChunk {
            chunk_id: "deadbeef".to_string(),
            data: vec![0xAA; 1024],
        };
        write_frame(&mut a, &sent).await.unwrap();
        let received: StorageRequest = read_frame(&mut b).await.unwrap();
        match received {
            StorageRequest::PrepareChunk { chunk_id, data } => {
                assert_eq!(chunk_id, "deadbeef");
                assert_eq!(data, vec![0xAA; 1024]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_before_length_is_a_framing_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let result: Result<StorageReply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(FsError::Framing(_))));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_a_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announce 100 bytes but deliver only 3.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        let result: Result<StorageReply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(FsError::Framing(_))));
    }

    #[tokio::test]
    async fn call_exchanges_one_frame_each_way() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request: StorageRequest = read_frame(&mut socket).await.unwrap();
            let reply = match request {
                StorageRequest::CommitChunk { .. } => StorageReply::Ack,
                _ => panic!("unexpected command"),
            };
            write_frame(&mut socket, &reply).await.unwrap();
        });

        let reply: StorageReply = call(
            &address,
            &StorageRequest::CommitChunk {
                chunk_id: "c1".to_string(),
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(matches!(reply, StorageReply::Ack));
    }

    #[tokio::test]
    async fn call_times_out_against_a_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // Accept but never answer.
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result: Result<StorageReply> = call(
            &address,
            &StorageRequest::CommitChunk {
                chunk_id: "c1".to_string(),
            },
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(FsError::DeadlineExceeded(_))));
    }
}
