use thiserror::Error;

use crate::config::ConfigError;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;
use crate::tracker::TrackerError;

/// Errors that end a torrent.
///
/// Connection-level problems never surface here; they close the socket
/// and the torrent carries on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine is not running")]
    Stopped,
}
