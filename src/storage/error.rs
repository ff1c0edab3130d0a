use thiserror::Error;

use crate::bencode::BencodeError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece hash mismatch for piece {0}")]
    HashMismatch(usize),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(usize),

    #[error("invalid block offset: piece {piece}, offset {offset}")]
    InvalidBlockOffset { piece: usize, offset: u32 },

    #[error("no inactive requests left for piece {0}")]
    NoRequest(usize),

    #[error("piece {0} is not held")]
    NotHeld(usize),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("invalid resume snapshot: {0}")]
    Snapshot(#[from] BencodeError),
}
