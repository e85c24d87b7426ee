//! Protocol error types

use thiserror::Error;

/// Errors produced while decoding viewer frames and messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed upload header: {0}")]
    MalformedUpload(String),

    #[error("Malformed chunk frame: {0}")]
    MalformedChunk(String),

    #[error("Chunk out of sequence: expected index {expected}, got {got}")]
    ChunkOutOfSequence { expected: u8, got: u8 },

    #[error("Chunk total changed mid-sequence: expected {expected}, got {got}")]
    ChunkTotalMismatch { expected: u8, got: u8 },

    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),

    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
