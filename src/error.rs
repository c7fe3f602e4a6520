use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds carried across the wire inside `Error` replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InsufficientSpace,
    UnknownChunk,
    UnknownFile,
    CommitWithoutPrepare,
    StaleOffset,
    NoServersAvailable,
    IoError,
    BadRequest,
    Internal,
}

#[derive(Error, Debug)]
pub enum FsError {
    // Transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("deadline exceeded talking to {0}")]
    DeadlineExceeded(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Capacity
    #[error("insufficient space on '{server}': need {needed} bytes, {free} free")]
    InsufficientSpace {
        server: String,
        needed: u64,
        free: u64,
    },

    // State
    #[error("unknown chunk '{0}'")]
    UnknownChunk(String),

    #[error("unknown file '{0}'")]
    UnknownFile(String),

    #[error("commit for '{0}' without a prior prepare")]
    CommitWithoutPrepare(String),

    #[error("stale offset for chunk '{chunk_id}': proposed {proposed} <= current {current}")]
    StaleOffset {
        chunk_id: String,
        proposed: u64,
        current: u64,
    },

    // Integrity
    #[error("persisted metadata at '{path}' is corrupt: {reason}")]
    CorruptMetadata { path: String, reason: String },

    #[error("chunk file '{0}' missing from the data directory")]
    MissingChunkFile(String),

    // Configuration
    #[error("configuration error: {0}")]
    Config(String),

    // Client-surface failures
    #[error("no storage servers available for {needed} bytes")]
    NoServersAvailable { needed: u64 },

    #[error("partial upload failure: {committed_chunks} chunk(s) committed, chunk '{failed_chunk}' failed")]
    PartialFailure {
        committed_chunks: usize,
        failed_chunk: String,
    },

    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl FsError {
    /// The wire code a server-side handler reports for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            FsError::InsufficientSpace { .. } => ErrorCode::InsufficientSpace,
            FsError::UnknownChunk(_) => ErrorCode::UnknownChunk,
            FsError::UnknownFile(_) => ErrorCode::UnknownFile,
            FsError::CommitWithoutPrepare(_) => ErrorCode::CommitWithoutPrepare,
            FsError::StaleOffset { .. } => ErrorCode::StaleOffset,
            FsError::NoServersAvailable { .. } => ErrorCode::NoServersAvailable,
            FsError::Io(_) | FsError::MissingChunkFile(_) => ErrorCode::IoError,
            FsError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// True for failures the client should retry with a fresh placement.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FsError::Io(_)
                | FsError::Framing(_)
                | FsError::DeadlineExceeded(_)
                | FsError::InsufficientSpace { .. }
                | FsError::Remote {
                    code: ErrorCode::InsufficientSpace,
                    ..
                }
                | FsError::Remote {
                    code: ErrorCode::IoError,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
