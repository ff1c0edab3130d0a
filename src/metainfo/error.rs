use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors that can occur when parsing torrent files.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The torrent file contains invalid bencode or a mistyped field.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// A field has an invalid value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// A file path escapes the torrent directory.
    #[error("unsafe file path: {0}")]
    PathTraversal(String),

    /// The info hash has an invalid length (must be 20 bytes).
    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    /// An I/O error occurred while reading the torrent file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
